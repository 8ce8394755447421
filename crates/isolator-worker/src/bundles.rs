//! Job bundles compiled into the worker binary.
//!
//! Only bundles listed in a request's `autoload` control key become
//! resolvable; everything else in the catalog stays dormant.

use std::io::Write;
use std::time::Duration;

use serde_json::{Value, json};

use isolator::{Bundle, Catalog, ErrorValue, JobInput};

pub const CORE: &str = "core";

pub fn builtin() -> Catalog {
    Catalog::new().with_bundle(core())
}

fn core() -> Bundle {
    Bundle::new(CORE)
        .job("echo", |input| Ok(input.args))
        .job("sum", sum)
        .job("fail", fail)
        .job("panic", |input| {
            panic!("{}", str_arg(&input.args, "message").unwrap_or("job panicked"))
        })
        .job("definition", |input| {
            let name = name_arg(&input)?;
            Ok(input.definition(name).cloned().unwrap_or(Value::Null))
        })
        .job("env", |input| {
            let name = name_arg(&input)?;
            Ok(std::env::var(name).map(Value::String).unwrap_or(Value::Null))
        })
        .job("cwd", |_| {
            let dir = std::env::current_dir()
                .map_err(|e| ErrorValue::new("IoError", e.to_string()))?;
            Ok(json!(dir.to_string_lossy()))
        })
        .job("warn", warn)
        .job("sleep", |input| {
            let secs = input.args.as_f64().unwrap_or(0.0).max(0.0);
            std::thread::sleep(Duration::from_secs_f64(secs));
            Ok(Value::Null)
        })
        .job("exit", exit)
        .job("abort", |_| std::process::abort())
}

fn sum(input: JobInput) -> Result<Value, ErrorValue> {
    let numbers = input
        .args
        .as_array()
        .ok_or_else(|| ErrorValue::new("TypeError", "sum expects an array of numbers"))?;

    if let Some(ints) = numbers.iter().map(Value::as_i64).collect::<Option<Vec<_>>>() {
        return Ok(json!(ints.iter().sum::<i64>()));
    }
    numbers
        .iter()
        .map(Value::as_f64)
        .collect::<Option<Vec<_>>>()
        .map(|floats| json!(floats.iter().sum::<f64>()))
        .ok_or_else(|| ErrorValue::new("TypeError", "sum expects an array of numbers"))
}

/// Fails with `{kind, message, file, line}` taken from the args.
fn fail(input: JobInput) -> Result<Value, ErrorValue> {
    let args = &input.args;
    let mut error = ErrorValue::new(
        str_arg(args, "kind").unwrap_or("RuntimeException"),
        str_arg(args, "message").unwrap_or("job failed"),
    );
    if let Some(file) = str_arg(args, "file") {
        let line = args
            .get("line")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok());
        error = error.with_location(file, line);
    }
    Err(error)
}

/// Writes a diagnostic line to stderr, then succeeds with the args.
fn warn(input: JobInput) -> Result<Value, ErrorValue> {
    let message = input.args.as_str().unwrap_or("something looks off");
    let mut stderr = std::io::stderr();
    writeln!(stderr, "Warning: {message}").map_err(|e| ErrorValue::new("IoError", e.to_string()))?;
    Ok(input.args)
}

/// Writes the given text to stdout and stderr, then exits without a response.
fn exit(input: JobInput) -> Result<Value, ErrorValue> {
    let args = &input.args;
    if let Some(text) = str_arg(args, "stdout") {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }
    if let Some(text) = str_arg(args, "stderr") {
        let _ = std::io::stderr().write_all(text.as_bytes());
    }
    let code = args
        .get("code")
        .and_then(Value::as_i64)
        .and_then(|n| i32::try_from(n).ok())
        .unwrap_or(0);
    std::process::exit(code)
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn name_arg(input: &JobInput) -> Result<&str, ErrorValue> {
    input
        .args
        .as_str()
        .ok_or_else(|| ErrorValue::new("TypeError", "expected a name string"))
}
