// crossbar: command-line tooling for the message switch.
use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use crossbar_broker::{MessageId, TraceMessage, TracedEvent};
use crossbar_client::Client;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "crossbar")]
#[command(about = "Command-line tooling for the crossbar message switch")]
struct Args {
    /// Switch host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Switch port
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Info-level logging
    #[arg(short, long)]
    verbose: bool,

    /// Debug-level logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List queue names
    List {
        /// Only names starting with this prefix
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// Print broker trace events
    Tail {
        /// Keep polling for new events
        #[arg(long)]
        follow: bool,
    },
    /// Render the current trace as an mscgen sequence chart
    Mscgen,
    /// Remove one message from a queue
    Ack { queue: String, id: u64 },
    /// Destroy a queue
    Destroy { queue: String },
    /// Print the broker diagnostics snapshot
    Diagnostics,
    /// Send a request and wait for the correlated reply
    Call {
        queue: String,
        /// Request body (stdin when neither --body nor --file is given)
        #[arg(long, conflicts_with = "file")]
        body: Option<String>,
        /// Read the request body from a file
        #[arg(long)]
        file: Option<PathBuf>,
        /// Seconds to wait for the reply
        #[arg(long, default_value_t = 10.0)]
        timeout: f64,
    },
    /// Consume a queue, answering each request with a program
    Serve {
        queue: String,
        /// Program fed each request on stdin; its stdout becomes the
        /// reply. Without it, requests are echoed back.
        #[arg(long)]
        program: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut client = Client::connect((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("connect to {}:{}", args.host, args.port))?;

    match args.command {
        Command::List { prefix } => {
            client.login(&cli_session()).await?;
            for name in client.list(&prefix).await? {
                println!("{name}");
            }
        }
        Command::Tail { follow } => {
            let mut cursor = 0;
            loop {
                let events = client.trace(cursor, if follow { 10.0 } else { 0.0 }).await?;
                for item in &events {
                    println!("{}", format_event(item));
                    cursor = item.cursor;
                }
                if !follow {
                    break;
                }
            }
        }
        Command::Mscgen => {
            let events = client.trace(0, 0.0).await?;
            print!("{}", render_mscgen(&events));
        }
        Command::Ack { queue, id } => {
            client.login(&cli_session()).await?;
            client.ack(&MessageId::new(queue, id)).await?;
        }
        Command::Destroy { queue } => {
            client.login(&cli_session()).await?;
            client.destroy(&queue).await?;
        }
        Command::Diagnostics => {
            let snapshot = client.diagnostics().await?;
            println!("time: {:.3}", snapshot.time);
            for (label, reports) in [
                ("transient", &snapshot.transient),
                ("permanent", &snapshot.permanent),
            ] {
                for report in reports {
                    let expected = report
                        .next_transfer_expected
                        .map(|ns| format!(" next-transfer-expected={ns}ns"))
                        .unwrap_or_default();
                    println!(
                        "{label} {} ({} queued){expected}",
                        report.queue,
                        report.contents.len()
                    );
                    for (id, entry) in &report.contents {
                        println!("  #{} {:?} {} bytes", id.index, entry.origin, entry.message.payload.len());
                    }
                }
            }
        }
        Command::Call {
            queue,
            body,
            file,
            timeout,
        } => {
            let payload = match (body, file) {
                (Some(text), _) => Bytes::from(text),
                (None, Some(path)) => Bytes::from(
                    tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("read {}", path.display()))?,
                ),
                (None, None) => {
                    let mut buffer = Vec::new();
                    tokio::io::stdin().read_to_end(&mut buffer).await?;
                    Bytes::from(buffer)
                }
            };
            client.login(&cli_session()).await?;
            let reply = client.call(&queue, payload, timeout).await?;
            tokio::io::stdout().write_all(&reply).await?;
        }
        Command::Serve { queue, program } => {
            client.login(&cli_session()).await?;
            tracing::info!(queue, "serving");
            match program {
                Some(program) => {
                    client
                        .serve_with(&queue, move |payload| run_program(program.clone(), payload))
                        .await?;
                }
                None => {
                    client
                        .serve_with(&queue, |payload| async move { Ok(payload) })
                        .await?;
                }
            }
        }
    }
    Ok(())
}

fn cli_session() -> String {
    format!("cli-{}", Uuid::new_v4())
}

/// Pipe one request payload through `program`; its stdout is the reply.
async fn run_program(program: String, payload: Bytes) -> std::io::Result<Bytes> {
    let mut child = tokio::process::Command::new(&program)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&payload).await?;
        // Dropping stdin closes it so the program sees EOF.
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(std::io::Error::other(format!(
            "{program} exited with {}",
            output.status
        )));
    }
    Ok(Bytes::from(output.stdout))
}

fn format_event(item: &TracedEvent) -> String {
    let event = &item.event;
    let input = event.input.as_deref().unwrap_or("-");
    let output = event.output.as_deref().unwrap_or("-");
    let detail = match &event.message {
        TraceMessage::Message { id, message } => {
            format!("message #{} ({} bytes)", id.index, message.payload.len())
        }
        TraceMessage::Ack { id } => format!("ack #{}", id.index),
    };
    let processing = event
        .processing_time
        .map(|ns| format!(" processing={:.3}ms", ns as f64 / 1e6))
        .unwrap_or_default();
    format!(
        "{:>6} {:.3} [{}] {input} -> {output} {detail}{processing}",
        item.cursor, event.time, event.queue
    )
}

/// Render trace events as an mscgen chart: sessions and queues become
/// entities, enqueues and dequeues become arcs.
fn render_mscgen(events: &[TracedEvent]) -> String {
    let mut entities = BTreeSet::new();
    for item in events {
        entities.insert(item.event.queue.clone());
        if let Some(input) = &item.event.input {
            entities.insert(input.clone());
        }
        if let Some(output) = &item.event.output {
            entities.insert(output.clone());
        }
    }
    let mut chart = String::from("msc {\n");
    let declarations: Vec<String> = entities
        .iter()
        .map(|entity| format!("\"{entity}\""))
        .collect();
    if !declarations.is_empty() {
        chart.push_str(&format!("  {};\n", declarations.join(", ")));
    }
    for item in events {
        let event = &item.event;
        match &event.message {
            TraceMessage::Message { id, message } => {
                let label = format!("#{} ({} bytes)", id.index, message.payload.len());
                if let Some(input) = &event.input {
                    chart.push_str(&format!(
                        "  \"{input}\" => \"{}\" [label=\"{label}\"];\n",
                        event.queue
                    ));
                }
                if let Some(output) = &event.output {
                    let label = match event.processing_time {
                        Some(ns) => format!("{label} {:.3}ms", ns as f64 / 1e6),
                        None => label.clone(),
                    };
                    chart.push_str(&format!(
                        "  \"{}\" => \"{output}\" [label=\"{label}\"];\n",
                        event.queue
                    ));
                }
            }
            TraceMessage::Ack { id } => {
                if let Some(input) = &event.input {
                    chart.push_str(&format!(
                        "  \"{input}\" -x \"{}\" [label=\"ack #{}\"];\n",
                        event.queue, id.index
                    ));
                }
            }
        }
    }
    chart.push_str("}\n");
    chart
}
