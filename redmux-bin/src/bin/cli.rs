use clap::{Parser, Subcommand};
use redmux_lib::resp3::OwnedNode;
use redmux_lib::{clients::Client, Collect, Request, DEFAULT_PORT};
use std::str;

#[derive(Parser, Debug)]
#[command(name = "redmux-cli", version, author, about = "Talk RESP3 to a Redis server")]
struct Cli {
    /// Server hostname.
    #[clap(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port.
    #[clap(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one command and print its reply as an indented node tree.
    Exec {
        /// The command name followed by its arguments, e.g. `exec LRANGE mylist 0 -1`.
        #[clap(required = true)]
        args: Vec<String>,
    },
    /// Print every message published on the given channels.
    Listen {
        #[clap(required = true)]
        channels: Vec<String>,
    },
}

// A one-shot CLI has no use for worker threads.
#[tokio::main(flavor = "current_thread")]
async fn main() -> redmux_lib::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = Client::connect(&cli.host, cli.port).await?;

    match cli.command {
        Command::Exec { args } => {
            let mut req = Request::new();
            req.push(args.iter());
            let (reply, bytes) = client.connection().exec(&req, Collect::new()).await?;
            for node in reply.into_nodes() {
                print_node(&node);
            }
            eprintln!("({bytes} response bytes)");
        }
        Command::Listen { channels } => {
            let mut subscriber = client.subscribe(channels).await?;
            while let Some(msg) = subscriber.next_message().await? {
                match str::from_utf8(&msg.content) {
                    Ok(text) => println!("[{}] {}", msg.channel, text),
                    Err(_) => println!("[{}] {:?}", msg.channel, msg.content),
                }
            }
        }
    }

    Ok(())
}

/// Renders one reply node, indented by its depth in the tree.
fn print_node(node: &OwnedNode) {
    let indent = node.depth * 2;
    if node.kind.is_aggregate() {
        println!("{:indent$}{:?}[{}]", "", node.kind, node.aggregate_size);
    } else {
        println!(
            "{:indent$}{:?} {}",
            "",
            node.kind,
            String::from_utf8_lossy(&node.data)
        );
    }
}
