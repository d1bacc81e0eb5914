// CLI binary.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::unreachable, clippy::indexing_slicing)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use lsl_engine::error::EngineError;
use lsl_engine::logging;
use lsl_engine::lsl::events::EventKind;
use lsl_engine::lsl::module::CompiledModule;
use lsl_engine::lsl::{compile_named, types::Type};
use lsl_engine::runtime::host::CallRecord;
use lsl_engine::runtime::{RecordingHost, ScriptInstance, Status, Value};
use lsl_engine::settings::{self, EngineSettings};

// ── CLI argument parsing ─────────────────────────────────────────

#[derive(Parser)]
#[command(name = "lsl-cli", about = "Compile and run LSL scripts", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine settings file (defaults apply when missing)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the memory limit from the settings file
    #[arg(long, global = true)]
    memory_limit: Option<i32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a script and report errors
    Check { script: PathBuf },
    /// Compile a script to module JSON
    Compile {
        script: PathBuf,
        /// Output path (stdout when omitted)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Print the bytecode of a script or module
    Disasm { script: PathBuf },
    /// Run `state_entry`, then each event, and print the host call log
    Run {
        script: PathBuf,
        /// Event to deliver, as `name` or `name:arg;arg;...`
        #[arg(short, long = "event")]
        events: Vec<String>,
    },
    /// Run with a suspension at every checkpoint, moving the script into a
    /// fresh instance each time, and print the host call log
    Migrate {
        script: PathBuf,
        #[arg(short, long = "event")]
        events: Vec<String>,
        /// Keep the last migration stream here
        #[arg(long)]
        stream: Option<PathBuf>,
    },
}

// ── Helpers ──────────────────────────────────────────────────────

fn load_settings(cli: &Cli) -> Result<EngineSettings, EngineError> {
    let mut settings = match &cli.config {
        Some(path) => settings::load_settings(path)?,
        None => EngineSettings::default(),
    };
    if let Some(limit) = cli.memory_limit {
        settings.memory_limit = limit;
    }
    Ok(settings)
}

/// Compile `.lsl` source, or load a module already compiled to JSON.
fn load_module(path: &Path) -> Result<CompiledModule, EngineError> {
    let text = fs::read_to_string(path)?;
    if path.extension().is_some_and(|e| e == "json") {
        return Ok(CompiledModule::from_json(&text)?);
    }
    let name = path.file_stem().map_or_else(|| "script".to_string(), |s| s.to_string_lossy().into_owned());
    compile_named(&text, &name).map_err(EngineError::Compile)
}

/// Parse `name` or `name:arg;arg;...`, converting each argument to the
/// event's declared parameter type.
fn parse_event(arg: &str) -> Result<(EventKind, Vec<Value>), EngineError> {
    let (name, rest) = arg.split_once(':').unwrap_or((arg, ""));
    let event = EventKind::from_name(name.trim()).ok_or_else(|| format!("unknown event {name}"))?;
    let raw: Vec<&str> = if rest.is_empty() { Vec::new() } else { rest.split(';').collect() };
    let sig = event.signature();
    if raw.len() != sig.len() {
        return Err(format!("{name} takes {} argument(s), got {}", sig.len(), raw.len()).into());
    }
    let args = raw
        .iter()
        .zip(sig)
        .map(|(text, &ty)| {
            let text = Value::String(text.trim().to_string());
            match ty {
                Type::List => Ok(Value::List(vec![text])),
                ty => text.cast_to(ty).map_err(|e| EngineError::Usage(e.to_string())),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((event, args))
}

fn print_call(record: &CallRecord) {
    let args: Vec<String> = record.args.iter().map(ToString::to_string).collect();
    println!("{}({})", record.function, args.join(", "));
}

fn print_summary(instance: &ScriptInstance) {
    eprintln!(
        "[lsl] state {} | {} | memory {}/{}",
        instance.state_name().unwrap_or("?"),
        instance.status().name(),
        instance.mem_usage(),
        instance.mem_limit()
    );
}

// ── Commands ─────────────────────────────────────────────────────

fn cmd_check(path: &Path) -> Result<(), EngineError> {
    let text = fs::read_to_string(path)?;
    match compile_named(&text, "check") {
        Ok(module) => {
            println!(
                "ok: {} function(s), {} state(s), {} global(s)",
                module.functions.len(),
                module.states.len(),
                module.globals.len()
            );
            Ok(())
        }
        Err(errors) => {
            for e in &errors {
                println!("{}", e.format_with_source(&text));
            }
            Err(EngineError::Compile(errors))
        }
    }
}

fn cmd_run(settings: &EngineSettings, path: &Path, events: &[String]) -> Result<(), EngineError> {
    let module = Arc::new(load_module(path)?);
    let events = events.iter().map(|e| parse_event(e)).collect::<Result<Vec<_>, _>>()?;
    let mut instance = ScriptInstance::new(module, settings)?;
    let mut host = RecordingHost::new();

    let deliveries = std::iter::once((EventKind::StateEntry, Vec::new())).chain(events);
    for (event, args) in deliveries {
        if instance.status() == Status::Disposed {
            break;
        }
        let mut status = instance.start(event, args, &mut host)?;
        while status == Status::Suspended {
            status = instance.resume(&mut host)?;
        }
    }
    host.log.iter().for_each(print_call);
    print_summary(&instance);
    Ok(())
}

fn cmd_migrate(
    settings: &EngineSettings,
    path: &Path,
    events: &[String],
    stream: Option<&Path>,
) -> Result<(), EngineError> {
    let module = Arc::new(load_module(path)?);
    let events = events.iter().map(|e| parse_event(e)).collect::<Result<Vec<_>, _>>()?;
    let settings = EngineSettings {
        always_suspend: true,
        ..settings.clone()
    };
    let mut instance = ScriptInstance::new(Arc::clone(&module), &settings)?;
    let mut host = RecordingHost::new();
    let mut hops = 0usize;
    let mut last = Vec::new();

    let deliveries = std::iter::once((EventKind::StateEntry, Vec::new())).chain(events);
    for (event, args) in deliveries {
        if instance.status() == Status::Disposed {
            break;
        }
        let mut status = instance.start(event, args, &mut host)?;
        while status == Status::Suspended {
            let buffer = SharedBuffer::default();
            instance.request_migrate_out(Box::new(buffer.clone()))?;
            last = buffer.take();
            instance = ScriptInstance::new(Arc::clone(&module), &settings)?;
            instance.migrate_in(last.as_slice())?;
            hops += 1;
            status = instance.resume(&mut host)?;
        }
    }
    if let Some(path) = stream {
        fs::write(path, &last)?;
    }
    host.log.iter().for_each(print_call);
    eprintln!("[lsl] {hops} migration(s), last stream {} bytes", last.len());
    print_summary(&instance);
    Ok(())
}

/// In-memory sink handed to an instance as its migration target.
#[derive(Clone, Default)]
struct SharedBuffer(Arc<parking_lot::Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl std::io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ── Main ─────────────────────────────────────────────────────────

fn run(cli: &Cli) -> Result<(), EngineError> {
    let settings = load_settings(cli)?;
    logging::init(&settings.log_filter);
    match &cli.command {
        Commands::Check { script } => cmd_check(script),
        Commands::Compile { script, out } => {
            let json = load_module(script)?.to_json()?;
            match out {
                Some(path) => fs::write(path, json)?,
                None => println!("{json}"),
            }
            Ok(())
        }
        Commands::Disasm { script } => {
            print!("{}", load_module(script)?.disassemble());
            Ok(())
        }
        Commands::Run { script, events } => cmd_run(&settings, script, events),
        Commands::Migrate {
            script,
            events,
            stream,
        } => cmd_migrate(&settings, script, events, stream.as_deref()),
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
