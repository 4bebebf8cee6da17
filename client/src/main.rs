use clap::Parser;
use client::{ClientError, Connector};
use log::info;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Gate address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:34567")]
    server: String,
}

enum Command {
    Request { route: String, payload: Vec<u8> },
    Notify { route: String, payload: Vec<u8> },
}

// `Service.Method payload`, or `!Service.Method payload` for a notify
fn parse_line(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (notify, line) = match line.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, line),
    };
    let (route, payload) = match line.split_once(char::is_whitespace) {
        Some((route, payload)) => (route, payload.trim_start()),
        None => (line, ""),
    };
    let route = route.to_string();
    let payload = payload.as_bytes().to_vec();
    Some(if notify {
        Command::Notify { route, payload }
    } else {
        Command::Request { route, payload }
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    let client = Arc::new(Connector::connect(&args.server).await?);
    println!(
        "Session {} open. Type `Service.Method payload`, prefix with `!` to notify.",
        client.session_id()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_line(&line) {
                    Some(Command::Notify { route, payload }) => {
                        if let Err(e) = client.notify(&route, payload) {
                            println!("! {}", e);
                        }
                    }
                    Some(Command::Request { route, payload }) => {
                        let client = Arc::clone(&client);
                        tokio::spawn(async move {
                            match client.request(&route, payload).await {
                                Ok(data) => println!("< {}: {}", route, String::from_utf8_lossy(&data)),
                                Err(ClientError::Remote(reason)) => println!("< {} failed: {}", route, reason),
                                Err(e) => println!("! {}", e),
                            }
                        });
                    }
                    None => {}
                }
            }
            push = client.next_push() => {
                match push {
                    Some(push) => println!("~ {}: {}", push.route, String::from_utf8_lossy(&push.data)),
                    None => {
                        println!("Connection closed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, disconnecting...");
                break;
            }
        }
    }

    client.close().await;

    Ok(())
}
