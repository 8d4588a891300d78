#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use serde_json::{json, Value};
use tsdx::config::LogConfig;
use tsdx::matrix::is_no_data;
use tsdx::observability::init_tracing;
use tsdx::protocol::{Command, RequestParams};
use tsdx::{ClientConfig, DataClient, DataMatrix, Response};

const USAGE: &str = "usage: tsdx-client [--json] [--chunk SECS] [--attempts N] <addr> <version|menu|getdata> [key=value ...]";

struct Args {
    json: bool,
    chunk: Option<f64>,
    attempts: Option<u32>,
    addr: String,
    command: Command,
    params: RequestParams,
}

fn parse_args() -> Result<Args, String> {
    let mut args = std::env::args().skip(1);
    let mut json = false;
    let mut chunk = None;
    let mut attempts = None;
    let mut positional = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--json" => json = true,
            "--chunk" => {
                let raw = args.next().ok_or("--chunk needs a value")?;
                chunk = Some(raw.parse::<f64>().map_err(|_| format!("bad --chunk '{}'", raw))?);
            }
            "--attempts" => {
                let raw = args.next().ok_or("--attempts needs a value")?;
                attempts = Some(raw.parse::<u32>().map_err(|_| format!("bad --attempts '{}'", raw))?);
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let addr = positional.next().ok_or(USAGE)?;
    let command = positional
        .next()
        .ok_or(USAGE)?
        .parse::<Command>()
        .map_err(|e| e.to_string())?;
    let mut params = RequestParams::new();
    for pair in positional {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{}'", pair))?;
        params.insert(key, value);
    }
    Ok(Args {
        json,
        chunk,
        attempts,
        addr,
        command,
        params,
    })
}

fn cell(v: f64) -> Value {
    if is_no_data(v) {
        Value::Null
    } else {
        json!(v)
    }
}

fn print_matrix(matrix: &DataMatrix, kind: Option<&str>, as_json: bool) {
    if as_json {
        let rows: Vec<Value> = matrix
            .row_iter()
            .map(|row| Value::Array(row.iter().map(|&v| cell(v)).collect()))
            .collect();
        let doc = json!({
            "type": kind,
            "columns": matrix.column_names(),
            "rows": rows,
        });
        println!("{}", doc);
        return;
    }
    let names = matrix.column_names();
    if !names.is_empty() {
        println!("{}", names.join(","));
    }
    for row in matrix.row_iter() {
        let line: Vec<String> = row
            .iter()
            .map(|&v| if is_no_data(v) { String::new() } else { v.to_string() })
            .collect();
        println!("{}", line.join(","));
    }
}

fn print_lines(lines: &[String], as_json: bool) {
    if as_json {
        println!("{}", json!({ "lines": lines }));
    } else {
        for line in lines {
            println!("{}", line);
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ClientConfig::new(args.addr);
    if let Some(attempts) = args.attempts {
        config = config.with_max_attempts(attempts);
    }
    config.validate()?;
    let mut client = DataClient::new(&config);

    match args.command {
        Command::Version => print_lines(&[client.version().await?], args.json),
        Command::Menu => {
            let lines: Vec<String> = client.menu().await?.iter().map(|s| s.to_line()).collect();
            print_lines(&lines, args.json);
        }
        Command::GetData => match args.chunk {
            Some(chunk) => match client.get_data_chunked(&args.params, chunk).await? {
                Some(matrix) => print_matrix(&matrix, None, args.json),
                None => print_lines(&[], args.json),
            },
            None => match client.get_data(&args.params).await? {
                Response::Binary { header, blocks } => {
                    for block in &blocks {
                        print_matrix(block, header.kind(), args.json);
                    }
                }
                Response::Text { lines, .. } => print_lines(&lines, args.json),
                Response::Error(message) => return Err(format!("server error: {}", message).into()),
            },
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            std::process::exit(2);
        }
    };

    let log = LogConfig {
        level: "warn".to_string(),
        json: false,
    };
    if let Err(e) = init_tracing(&log) {
        eprintln!("failed to initialize logging: {}", e);
    }

    if let Err(e) = run(args).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
