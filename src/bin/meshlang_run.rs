//! CLI launcher
//!
//! `meshlang_run <script.json>` loads a recorded program (the serialized
//! control IR, declarations included), compiles it, and either runs it on
//! the reference executor — printing the final value of every global — or
//! writes the task-spec artifact for an external runtime.
//!
//! Flags:
//!   --backend cpu|gpu      compilation target (default cpu; gpu graphs
//!                          are emitted but not executable here)
//!   --emit-tasks <path>    write the task graph as JSON and skip execution
//!
//! Exit code 0 on success, 1 on any error, with the error chain printed.

#![forbid(unsafe_code)]

use std::{env, fs, process::ExitCode};

use anyhow::Context as _;
use meshlang::{compile, exec, ir::Decl, ir::Program, task::Backend, GlobalId};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn usage() -> ! {
    eprintln!("usage: meshlang_run <script.json> [--backend cpu|gpu] [--emit-tasks <path>]");
    std::process::exit(1);
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let positional: Vec<&String> = args
        .iter()
        .enumerate()
        .filter(|(i, a)| {
            !a.starts_with("--") && !(*i > 0 && args[*i - 1].starts_with("--"))
        })
        .map(|(_, a)| a)
        .collect();
    let script = match positional.as_slice() {
        [s] => (*s).clone(),
        _ => usage(),
    };

    let backend = match parse_flag(&args, "--backend").as_deref() {
        None | Some("cpu") => Backend::Cpu,
        Some("gpu") => Backend::Gpu,
        Some(other) => anyhow::bail!("unknown backend {other:?} (expected cpu or gpu)"),
    };

    let text =
        fs::read_to_string(&script).with_context(|| format!("read script {script}"))?;
    let program: Program =
        serde_json::from_str(&text).with_context(|| format!("parse script {script}"))?;

    let graph = compile(&program, backend).context("compile program")?;
    tracing::info!(
        tasks = graph.tasks.len(),
        digest = %graph.manifest.program_digest,
        "compiled"
    );

    if let Some(out) = parse_flag(&args, "--emit-tasks") {
        let json = serde_json::to_string_pretty(&graph).expect("task graph serializes");
        fs::write(&out, json).with_context(|| format!("write task graph {out}"))?;
        println!("wrote {} task(s) to {out}", graph.tasks.len());
        return Ok(());
    }

    let machine = exec::run(&graph).context("execute program")?;

    // Final globals, in declaration order (global ids are dense in it).
    let mut next = 0usize;
    for decl in &program.decls {
        if let Decl::NewGlobal { name, .. } = decl {
            let value = machine.global_value(GlobalId(next))?;
            println!("{name} = {value:?}");
            next += 1;
        }
    }
    Ok(())
}
