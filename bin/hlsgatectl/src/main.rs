use std::collections::HashMap;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use reqwest::StatusCode;
use serde_json::{json, Value};

const EXIT_BAD_INPUT: u8 = 1;
const EXIT_UNREACHABLE: u8 = 2;
const EXIT_NOT_FOUND: u8 = 3;

#[derive(Parser, Debug)]
#[clap(name = "hlsgatectl", about = "Control a running hlsgated instance")]
struct Args {
    /// Base URL of the hlsgated control plane
    #[clap(short, long, default_value = "http://127.0.0.1:8000", env = "HLSGATE_SERVER")]
    server: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start converting a DASH stream
    Add {
        /// Source DASH manifest URL
        #[clap(long)]
        mpd_url: String,
        /// CENC key, 32 hex chars
        #[clap(long)]
        key: Option<String>,
        /// KID for the key (inferred from the manifest when omitted)
        #[clap(long)]
        kid: Option<String>,
        /// Additional key as "KID:KEY" (hex); repeatable
        #[clap(long = "key-map", value_name = "KID:KEY")]
        key_map: Vec<String>,
        /// Path to the mp4decrypt binary
        #[clap(long)]
        mp4decrypt_path: Option<String>,
        /// Force a specific representation id
        #[clap(long)]
        representation_id: Option<String>,
        /// Display label
        #[clap(long)]
        label: Option<String>,
        /// Refresh cadence in seconds (live)
        #[clap(long)]
        poll_interval: Option<f64>,
        /// Sliding window length (live)
        #[clap(long)]
        window_size: Option<usize>,
        /// Processed-segment history capacity
        #[clap(long)]
        history_size: Option<usize>,
        /// Custom output directory for this stream
        #[clap(long)]
        output_dir: Option<String>,
        /// Extra HTTP header, "Name: value"; repeatable
        #[clap(short = 'H', long = "header")]
        headers: Vec<String>,
    },
    /// List all streams
    List,
    /// Show one stream
    Get { id: String },
    /// Stop and remove a stream
    Remove { id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // clap would exit 2 on its own; 2 means "server unreachable" here
            let _ = e.print();
            return ExitCode::from(EXIT_BAD_INPUT);
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

async fn run(args: Args) -> Result<(), u8> {
    let client = reqwest::Client::new();
    let base = args.server.trim_end_matches('/').to_string();

    let response = match &args.command {
        Command::Add {
            mpd_url,
            key,
            kid,
            key_map,
            mp4decrypt_path,
            representation_id,
            label,
            poll_interval,
            window_size,
            history_size,
            output_dir,
            headers,
        } => {
            let headers = parse_headers(headers)?;
            let key_map = parse_key_map(key_map)?;
            let mut body = json!({ "mpd_url": mpd_url });
            let object = body.as_object_mut().unwrap();
            if let Some(v) = key {
                object.insert("key".into(), json!(v));
            }
            if let Some(v) = kid {
                object.insert("kid".into(), json!(v));
            }
            if !key_map.is_empty() {
                object.insert("key_map".into(), json!(key_map));
            }
            if let Some(v) = mp4decrypt_path {
                object.insert("mp4decrypt_path".into(), json!(v));
            }
            if let Some(v) = representation_id {
                object.insert("representation_id".into(), json!(v));
            }
            if let Some(v) = label {
                object.insert("label".into(), json!(v));
            }
            if let Some(v) = poll_interval {
                object.insert("poll_interval".into(), json!(v));
            }
            if let Some(v) = window_size {
                object.insert("window_size".into(), json!(v));
            }
            if let Some(v) = history_size {
                object.insert("history_size".into(), json!(v));
            }
            if let Some(v) = output_dir {
                object.insert("output_dir".into(), json!(v));
            }
            if !headers.is_empty() {
                object.insert("headers".into(), json!(headers));
            }

            client.post(format!("{base}/streams")).json(&body).send().await
        }
        Command::List => client.get(format!("{base}/streams")).send().await,
        Command::Get { id } => client.get(format!("{base}/streams/{id}")).send().await,
        Command::Remove { id } => client.delete(format!("{base}/streams/{id}")).send().await,
    };

    let response = response.map_err(|e| {
        eprintln!("error: cannot reach {base}: {e}");
        EXIT_UNREACHABLE
    })?;

    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);

    if status == StatusCode::NOT_FOUND {
        eprintln!("error: stream not found");
        return Err(EXIT_NOT_FOUND);
    }
    if status.is_client_error() {
        eprintln!(
            "error: {}",
            body.get("error").and_then(Value::as_str).unwrap_or("bad request")
        );
        return Err(EXIT_BAD_INPUT);
    }
    if !status.is_success() {
        eprintln!("error: server returned {status}: {body}");
        return Err(EXIT_UNREACHABLE);
    }

    println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    Ok(())
}

fn parse_headers(raw: &[String]) -> Result<HashMap<String, String>, u8> {
    let mut headers = HashMap::new();
    for entry in raw {
        let Some((name, value)) = entry.split_once(':') else {
            eprintln!("error: invalid header {entry:?}, expected \"Name: value\"");
            return Err(EXIT_BAD_INPUT);
        };
        headers.insert(name.trim().to_string(), value.trim().to_string());
    }
    Ok(headers)
}

fn parse_key_map(raw: &[String]) -> Result<HashMap<String, String>, u8> {
    let mut keys = HashMap::new();
    for entry in raw {
        let Some((kid, key)) = entry.split_once(':') else {
            eprintln!("error: invalid key map entry {entry:?}, expected \"KID:KEY\"");
            return Err(EXIT_BAD_INPUT);
        };
        keys.insert(kid.trim().to_string(), key.trim().to_string());
    }
    Ok(keys)
}
