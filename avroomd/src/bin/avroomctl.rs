//! Small command-line client for a running avroom daemon
//! Usage: avroomctl <command> [args]
//!
//! The socket path defaults to the daemon's and can be overridden with
//! `AVROOMD_SOCKET`.

use avroom_common::ipc_client::{IpcClient, DEFAULT_SOCKET_PATH};
use avroom_common::{tracing, ActivityMode, MatrixAction, MatrixOutput, Request, Response, TieType};
use std::process;
use tracing::error;

fn usage(program: &str) -> ! {
    eprintln!("Usage: {} <command> [args]", program);
    eprintln!("\nCommands:");
    eprintln!("  status                                  Room state and pending transition");
    eprintln!("  activity <standby|share|adv-share|group-work>");
    eprintln!("  routes [--refresh]                      What each destination is showing");
    eprintln!("  devices                                 Registered devices");
    eprintln!("  tie <output|all> <input> [av|vid|aud|untie]");
    eprintln!("  shutdown-prompt                         Ask the panels to confirm shutdown");
    process::exit(1);
}

fn parse_request(args: &[String]) -> Result<Request, String> {
    let command = args.first().map(String::as_str).unwrap_or_default();
    match command {
        "status" => Ok(Request::GetStatus),
        "devices" => Ok(Request::GetDevices),
        "shutdown-prompt" => Ok(Request::PromptShutdown),
        "routes" => Ok(Request::GetCurrentSources {
            update: args.get(1).map(String::as_str) == Some("--refresh"),
        }),
        "activity" => {
            let activity: ActivityMode = args
                .get(1)
                .ok_or("activity needs a mode")?
                .parse()
                .map_err(|e| format!("{}", e))?;
            Ok(Request::RequestActivity { activity })
        }
        "tie" => {
            let output: MatrixOutput = args
                .get(1)
                .ok_or("tie needs an output")?
                .parse()
                .map_err(|e| format!("{}", e))?;
            let input: u16 = args
                .get(2)
                .ok_or("tie needs an input")?
                .parse()
                .map_err(|_| "input must be a number".to_string())?;
            let tie_type = match args.get(3) {
                Some(t) => t.parse::<TieType>().map_err(|e| format!("{}", e))?,
                None => TieType::AudioVideo,
            };
            Ok(Request::MatrixAction {
                actions: vec![MatrixAction::new(output, input, tie_type)],
            })
        }
        other => Err(format!("unknown command '{}'", other)),
    }
}

fn print_response(response: Response) -> i32 {
    match response {
        Response::Status {
            version,
            uptime_seconds,
            system_state,
            activity,
            transition,
            devices_count,
        } => {
            println!("avroomd {} (up {}s)", version, uptime_seconds);
            println!("State:    {}", system_state);
            println!("Activity: {}", activity);
            println!("Devices:  {}", devices_count);
            if let Some(t) = transition {
                println!(
                    "Pending:  state {} -> {}, activity {} -> {}",
                    system_state, t.state.target, activity, t.activity.target
                );
            }
            0
        }
        Response::Routes(routes) => {
            for route in routes {
                println!("{}", route);
            }
            0
        }
        Response::Devices(devices) => {
            for device in devices {
                println!("{}", device);
            }
            0
        }
        Response::Ack => {
            println!("OK");
            0
        }
        Response::Error(message) => {
            eprintln!("Error: {}", message);
            1
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let program = args.first().cloned().unwrap_or_else(|| "avroomctl".to_string());
    if args.len() < 2 {
        usage(&program);
    }

    let request = match parse_request(&args[1..]) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{}", e);
            usage(&program);
        }
    };

    let socket_path = std::env::var("AVROOMD_SOCKET").unwrap_or_else(|_| DEFAULT_SOCKET_PATH.to_string());
    let client = IpcClient::with_socket_path(&socket_path).with_retry_params(0, 0);

    match client.send(&request).await {
        Ok(response) => process::exit(print_response(response)),
        Err(e) => {
            error!("Request to {} failed: {}", socket_path, e);
            process::exit(2);
        }
    }
}
