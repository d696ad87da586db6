#[derive(clap::Parser, Debug)]
#[command(
    name = "iskndr",
    version,
    about = "Expose a local HTTP service to the internet"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    #[clap(about = "Expose a local application to the internet")]
    Tunnel {
        #[arg(
            help = "Destination to forward to: a port number (e.g. 8080, defaults to localhost) or host:port (e.g. foo.bar:80)"
        )]
        destination: String,

        #[arg(
            long,
            help = "Tunnel server URL (e.g., localhost:8080, https://tunnel.example.com)"
        )]
        server: String,

        #[arg(long, help = "Enable structured logging to stderr")]
        logging: bool,

        #[arg(long, help = "Skip TLS certificate verification when dialing wss")]
        allow_insecure: bool,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    use clap::Parser;

    let cli = Cli::parse();
    let graceful = iskndr_utils::Graceful::default();

    match cli.command {
        Command::Tunnel {
            destination,
            server,
            logging,
            allow_insecure,
        } => {
            if logging {
                // run with RUST_LOG="iskndr=trace,iskndr_utils=trace" for details
                tracing_subscriber::fmt()
                    .with_writer(std::io::stderr)
                    .init();
            }

            let destination = iskndr::parse_destination(&destination)?;
            let server_url = iskndr::parse_server_url(&server)?;

            tracing::info!(%destination, %server_url, "starting tunnel");

            let session = iskndr::connect(&server_url, allow_insecure).await?;

            if !logging {
                print_tunnel_info(&destination, &server, &session.public_url);
            }

            let graceful_for_run = graceful.clone();
            graceful.spawn(async move {
                if let Err(e) = iskndr::run(session, destination, graceful_for_run).await {
                    tracing::error!("tunnel failed: {e:?}");
                    eprintln!("Tunnel disconnected: {e}");
                    std::process::exit(1);
                }
            });

            graceful.shutdown().await
        }
    }
}

fn print_tunnel_info(destination: &str, server: &str, public_url: &str) {
    use colored::Colorize;

    println!(
        "{} is forwarding {} → {}",
        "Iskndr".on_green().black(),
        public_url.yellow(),
        destination.yellow()
    );
    println!("{} {}", "Tunnel server:".dimmed(), server);
    println!("Press ctrl+c to stop.");
}
