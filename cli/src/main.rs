//! The `smile` command-line runner: a thin wrapper over the interpreter
//! engine that loads a script (or `-e` snippets), optionally checks or
//! prints the raw form, and runs it.

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use smile::{Engine, EvalResult, ExternalFunction, ParseMessage, Severity, Value};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(ClapParser, Debug)]
#[command(name = "smile", version, about = "The Smile programming language")]
struct Args {
    /// The script to run.
    script: Option<PathBuf>,

    /// Arguments passed to the script (after `--`).
    #[arg(trailing_var_arg = true)]
    script_args: Vec<String>,

    /// One line of program (several -e's allowed; omit the script file).
    #[arg(short = 'e', value_name = "SCRIPT")]
    expr: Vec<String>,

    /// Check syntax and for warnings/errors, but do not run.
    #[arg(short = 'c', long = "check")]
    check: bool,

    /// Like --check, but print the resulting raw form of the code.
    #[arg(short = 'r', long = "raw")]
    raw: bool,

    /// Predeclare a global constant, as name=value.
    #[arg(short = 'D', value_name = "NAME=VALUE")]
    define: Vec<String>,

    /// Wrap the script in a read-loop over stdin.
    #[arg(short = 'n')]
    read_loop: bool,

    /// Like -n, but print each line after the script runs.
    #[arg(short = 'p')]
    print_loop: bool,

    /// Print the result of the program.
    #[arg(short = 'o')]
    output_result: bool,

    /// Do not display warning messages.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Display additional debugging information.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Treat warnings as errors.
    #[arg(long = "warnings-as-errors")]
    warnings_as_errors: bool,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            // Invalid command lines report a negative status, which the
            // OS sees as 255.
            std::process::exit(-1);
        }
    };

    let filter = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("smile: {:#}", err);
            ExitCode::from(1)
        }
    }
}

fn run(args: Args) -> Result<ExitCode> {
    let mut engine = Engine::new();
    install_stdio(&mut engine);
    tracing::debug!(defines = args.define.len(), "engine ready");

    for define in &args.define {
        let (name, value) = define
            .split_once('=')
            .with_context(|| format!("-D '{}' is not of the form name=value", define))?;
        engine.declare_constant(name, parse_define(value));
    }

    let script_args = Value::list(
        args.script_args
            .iter()
            .map(|arg| Value::Str(arg.as_str().into()))
            .collect(),
    );
    let argv = engine.intern("argv");
    engine.set_global_variable(argv, script_args);

    let (mut source, filename) = if !args.expr.is_empty() {
        if args.script.is_some() {
            anyhow::bail!("cannot use both a script name and -e on the command line");
        }
        (args.expr.join("\n"), "<cmdline>".to_string())
    } else if let Some(path) = &args.script {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read '{}'", path.display()))?;
        (text, path.display().to_string())
    } else {
        anyhow::bail!("no program given (supply a script file or -e)");
    };

    if args.read_loop || args.print_loop {
        source = wrap_in_read_loop(&source, args.print_loop);
    }

    let outcome = engine.parse(&source, &filename);
    if report_messages(&outcome.messages, &args) {
        return Ok(ExitCode::from(1));
    }

    if args.check || args.raw {
        if args.raw {
            println!("{}", engine.stringify(&outcome.expr));
        }
        return Ok(ExitCode::SUCCESS);
    }

    let program = match engine.compile(&outcome.expr, &filename) {
        Ok(program) => program,
        Err(messages) => {
            report_messages(&messages, &args);
            return Ok(ExitCode::from(1));
        }
    };

    match engine.run_program(program) {
        EvalResult::Value(value) => {
            if args.output_result {
                println!("{}", engine.stringify(&value));
            }
            Ok(ExitCode::SUCCESS)
        }
        EvalResult::Exception(exception) => {
            let message = exception
                .get_property(smile::known::MESSAGE)
                .unwrap_or(Value::Null);
            eprintln!("uncaught exception: {}", message.to_display(engine.symbols()));
            if let Some(trace) = exception.get_property(smile::known::STACK_TRACE) {
                for entry in trace.iter_list() {
                    eprintln!("  at {}", entry.to_display(engine.symbols()));
                }
            }
            Ok(ExitCode::from(1))
        }
        EvalResult::Break(_) => {
            eprintln!("stopped at breakpoint");
            Ok(ExitCode::from(2))
        }
    }
}

/// Report diagnostics; returns true when the program should not run.
fn report_messages(messages: &[ParseMessage], args: &Args) -> bool {
    let mut fatal = false;
    for message in messages {
        match message.severity {
            Severity::Error => {
                eprintln!("{}", message);
                fatal = true;
            }
            Severity::Warning => {
                if args.warnings_as_errors {
                    eprintln!("{}", message);
                    fatal = true;
                } else if !args.quiet {
                    eprintln!("{}", message);
                }
            }
            Severity::Info => {
                if !args.quiet {
                    eprintln!("{}", message);
                }
            }
        }
    }
    fatal
}

/// The standard wrapper for -n and -p.
fn wrap_in_read_loop(body: &str, print_each_line: bool) -> String {
    let print_clause = if print_each_line {
        "\t[print line]\n"
    } else {
        ""
    };
    format!(
        "till done do {{\n\
         \tline = [get-line]\n\
         \tif line === null then done\n\
         {}\
         {}\n\
         }}\n",
        body, print_clause
    )
}

/// -D values are literals: integers, true/false/null, or plain strings.
fn parse_define(text: &str) -> Value {
    match text {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => (),
    }
    if let Ok(n) = text.parse::<i64>() {
        return Value::Int64(n);
    }
    if let Ok(n) = text.parse::<f64>() {
        return Value::Float64(n);
    }
    Value::Str(text.into())
}

/// The handful of I/O externals the runner provides: `print` and
/// `get-line`.  The full standard library is a separate concern; these
/// exist so -n/-p/-o pipelines work out of the box.
fn install_stdio(engine: &mut Engine) {
    engine.register_external_function(ExternalFunction::plain(
        "print",
        0,
        0,
        |ctx, args| {
            let mut out = std::io::stdout().lock();
            for (index, arg) in args.iter().enumerate() {
                if index > 0 {
                    let _ = write!(out, " ");
                }
                let _ = write!(out, "{}", arg.to_display(ctx.symbols));
            }
            let _ = writeln!(out);
            Ok(Value::Null)
        },
    ));

    engine.register_external_function(ExternalFunction::plain(
        "get-line",
        0,
        1,
        |_ctx, _args| {
            let mut line = String::new();
            let n = std::io::stdin()
                .lock()
                .read_line(&mut line)
                .unwrap_or(0);
            if n == 0 {
                Ok(Value::Null)
            } else {
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                Ok(Value::Str(line.into()))
            }
        },
    ));
}
