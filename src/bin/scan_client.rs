use std::{path::PathBuf, process::ExitCode};

use prefix_scan::{data_file, telemetry, Config, Operation, Requester};

fn print_usage(exe: &str) {
    eprintln!(
        "usage: {exe} <data-file> <operation>

OPERATIONS:
    1  add
    2  subtract
    3  multiply
    4  max
    5  min
    6  gcd

example: {exe} data 1"
    );
}

fn format_values(values: &[i32]) -> String {
    let items: Vec<String> = values.iter().map(i32::to_string).collect();
    format!("[{}]", items.join(", "))
}

fn main() -> ExitCode {
    telemetry::init();

    let args: Vec<String> = std::env::args().collect();
    let exe = args.first().map_or("scan-client", String::as_str);

    let [_, path, code] = args.as_slice() else {
        print_usage(exe);
        return ExitCode::from(2);
    };

    let Some(op) = code.parse().ok().and_then(|c| Operation::from_code(c).ok()) else {
        eprintln!("invalid operation {code:?}");
        print_usage(exe);
        return ExitCode::from(2);
    };

    match run(PathBuf::from(path), op) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(path: PathBuf, op: Operation) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let values = data_file::read_values(&path)?;

    let requester = Requester::from_config(&config);
    println!("requester {}: {} values from {}", requester.id(), values.len(), path.display());
    println!("    {}", format_values(&values));

    let result = requester.submit(op, &values)?;

    println!("{op} scan:");
    println!("    {}", format_values(&result));

    Ok(())
}
