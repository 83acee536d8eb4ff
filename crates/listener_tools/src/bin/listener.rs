#![forbid(unsafe_code)]

use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::Path;

use listener_tools::operator_cli::{build_verifier, execute_store_stats, execute_token_command};

const USAGE: &str = "usage: listener token <mint|verify> <arg> | listener store stats <path>";

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    let output = match (args.first().map(String::as_str), args.get(1).map(String::as_str)) {
        (Some("token"), Some(subcommand)) => {
            let secret = read_token_secret()?;
            let verifier = build_verifier(&secret)?;
            execute_token_command(&verifier, subcommand, args.get(2).map(String::as_str))?
        }
        (Some("store"), Some("stats")) => {
            let path = args.get(2).ok_or_else(|| USAGE.to_string())?;
            execute_store_stats(Path::new(path))?
        }
        _ => return Err(USAGE.to_string()),
    };
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

/// `LISTENER_TOKEN_SECRET` when set, otherwise a hidden prompt (or stdin when piped).
fn read_token_secret() -> Result<String, String> {
    if let Some(secret) = env::var("LISTENER_TOKEN_SECRET")
        .ok()
        .filter(|v| !v.trim().is_empty())
    {
        return Ok(secret.trim().to_string());
    }
    let secret = if io::stdin().is_terminal() {
        rpassword::prompt_password("Token secret:").map_err(|e| e.to_string())?
    } else {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .map_err(|e| e.to_string())?;
        input
    };
    let secret = secret.trim().to_string();
    if secret.is_empty() {
        return Err("token secret must not be empty".to_string());
    }
    Ok(secret)
}
