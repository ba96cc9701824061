use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use vm::{
    InstructionSet, JitConfig, Method, MethodTable, Runtime, Value, assemble_methods,
    describe_stack,
};

#[derive(Debug, Clone, PartialEq, Default)]
struct CliConfig {
    source: Option<String>,
    entry: Option<String>,
    args: Vec<String>,
    config_path: Option<String>,
    isa: Option<InstructionSet>,
    hot_threshold: Option<u32>,
    repeat: u32,
    compile: bool,
    jit_dump: bool,
    snapshot: bool,
    disassemble: bool,
    help: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }

    let mut config = match cli.config_path.as_ref() {
        Some(path) => JitConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => JitConfig::default(),
    };
    if let Some(isa) = cli.isa {
        config.isa = isa;
    }
    if let Some(hot) = cli.hot_threshold {
        config.hot_threshold = hot;
    }

    let source_path = cli
        .source
        .as_ref()
        .ok_or_else(|| io::Error::other("missing source path"))?;
    let source = std::fs::read_to_string(source_path)?;
    let methods = Arc::new(MethodTable::new());
    for builder in assemble_methods(&source)? {
        methods.register(builder);
    }
    let runtime = Runtime::new(config, Arc::clone(&methods))?;
    let entry_name = cli
        .entry
        .as_ref()
        .ok_or_else(|| io::Error::other("missing entry method"))?;
    let entry = methods
        .find(entry_name)
        .ok_or_else(|| io::Error::other(format!("no method named '{entry_name}'")))?;
    let args = parse_values(&entry, &cli.args).map_err(io::Error::other)?;

    if cli.compile {
        runtime.compile_method_now(&entry)?;
    }
    let thread = runtime.new_thread();
    let mut result = Value::Void;
    for _ in 0..cli.repeat.max(1) {
        result = match runtime.invoke(&thread, &entry, &args) {
            Ok(value) => value,
            Err(err) => {
                eprintln!("{err}");
                eprint!("{}", describe_stack(&thread));
                return Err(err.into());
            }
        };
    }
    runtime.with_jit(|jit| jit.wait_idle(Duration::from_secs(5)));
    println!("{} = {result}", entry.pretty_name());

    if cli.disassemble {
        if let Some(code) = entry.compiled() {
            print!("{}", code.disassemble());
        } else {
            println!("{} has no compiled code", entry.pretty_name());
        }
    }
    if cli.jit_dump {
        println!("{}", runtime.jit_dump());
    }
    if cli.snapshot {
        println!("{}", runtime.jit_snapshot().to_json());
    }
    Ok(())
}

fn parse_values(method: &Method, raw: &[String]) -> Result<Vec<Value>, String> {
    let mut kinds: Vec<char> = method.shorty().chars().skip(1).collect();
    if !method.is_static() {
        kinds.insert(0, 'L');
    }
    if kinds.len() != raw.len() {
        return Err(format!(
            "{} takes {} arguments, {} given",
            method.pretty_name(),
            kinds.len(),
            raw.len()
        ));
    }
    kinds
        .iter()
        .zip(raw)
        .map(|(kind, text)| {
            let invalid = || format!("invalid '{kind}' argument '{text}'");
            Ok(match kind {
                'J' => Value::Long(text.parse().map_err(|_| invalid())?),
                'F' => Value::Float(text.parse().map_err(|_| invalid())?),
                'D' => Value::Double(text.parse().map_err(|_| invalid())?),
                'L' | '[' if text == "null" => Value::Object(0),
                'L' | '[' => return Err(format!("only null references can be passed, got '{text}'")),
                _ => Value::Int(text.parse().map_err(|_| invalid())?),
            })
        })
        .collect()
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig {
        repeat: 1,
        ..CliConfig::default()
    };
    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                cfg.help = true;
                index += 1;
            }
            "--config" => {
                let path = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                cfg.config_path = Some(path.clone());
                index += 2;
            }
            "--isa" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --isa".to_string())?;
                let isa = InstructionSet::parse(raw).ok_or_else(|| format!("unknown isa '{raw}'"))?;
                cfg.isa = Some(isa);
                index += 2;
            }
            "--hot" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --hot".to_string())?;
                let value = raw
                    .parse::<u32>()
                    .map_err(|_| format!("invalid --hot value '{raw}'"))?;
                cfg.hot_threshold = Some(value);
                index += 2;
            }
            "--repeat" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --repeat".to_string())?;
                cfg.repeat = raw
                    .parse::<u32>()
                    .map_err(|_| format!("invalid --repeat value '{raw}'"))?;
                index += 2;
            }
            "--compile" => {
                cfg.compile = true;
                index += 1;
            }
            "--jit-dump" => {
                cfg.jit_dump = true;
                index += 1;
            }
            "--snapshot" => {
                cfg.snapshot = true;
                index += 1;
            }
            "--disasm" => {
                cfg.disassemble = true;
                index += 1;
            }
            value if value.starts_with("--") => {
                return Err(format!("unknown flag '{value}'"));
            }
            value => {
                if cfg.source.is_none() {
                    cfg.source = Some(value.to_string());
                } else if cfg.entry.is_none() {
                    cfg.entry = Some(value.to_string());
                } else {
                    cfg.args.push(value.to_string());
                }
                index += 1;
            }
        }
    }
    if !cfg.help && (cfg.source.is_none() || cfg.entry.is_none()) {
        return Err("usage: dx-vm-run [flags] <source> <Class.method> [args...]".to_string());
    }
    Ok(cfg)
}

fn print_usage() {
    println!("usage: dx-vm-run [flags] <source> <Class.method> [args...]");
    println!();
    println!("flags:");
    println!("  --config <file>   load JIT settings from a JSON file");
    println!("  --isa <name>      target: arm, thumb2, x86 or mips");
    println!("  --hot <n>         invocations or backward branches before compiling");
    println!("  --repeat <n>      invoke the entry method n times");
    println!("  --compile         compile the entry method before the first call");
    println!("  --disasm          print the entry method's compiled code");
    println!("  --jit-dump        print traces and compile attempts");
    println!("  --snapshot        print the JIT snapshot as JSON");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn positional_arguments_fill_source_entry_then_values() {
        let cfg = parse_cli_args(&strings(&["--isa", "mips", "prog.dx", "T.add", "1", "2"]))
            .expect("parse");
        assert_eq!(cfg.isa, Some(InstructionSet::Mips));
        assert_eq!(cfg.source.as_deref(), Some("prog.dx"));
        assert_eq!(cfg.entry.as_deref(), Some("T.add"));
        assert_eq!(cfg.args, strings(&["1", "2"]));
    }

    #[test]
    fn negative_values_are_not_flags() {
        let cfg = parse_cli_args(&strings(&["prog.dx", "T.neg", "-4"])).expect("parse");
        assert_eq!(cfg.args, strings(&["-4"]));
    }

    #[test]
    fn bad_flags_are_rejected() {
        assert!(parse_cli_args(&strings(&["--isa", "sparc", "a", "b"])).is_err());
        assert!(parse_cli_args(&strings(&["--verbose", "a", "b"])).is_err());
        assert!(parse_cli_args(&strings(&["only-source"])).is_err());
    }
}
