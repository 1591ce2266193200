use clap::Parser;

/// Declarative specification of command-line arguments. See the
/// [clap documentation](https://docs.rs/clap/4) for more information.
#[derive(Clone, Debug, Parser)]
#[command(
    name = "linknet",
    about = "Peer-to-peer chat and file sharing over a local network"
)]
pub struct Args {
    /// Port on which to listen for peer connections.
    #[arg(long, default_value = "8080")]
    pub port: u16,

    /// Dial peers discovered on the local network automatically.
    #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
    pub auto_connect: bool,

    /// Disable automatic dialing of discovered peers.
    #[arg(long)]
    pub no_auto_connect: bool,

    /// Display name used in chat messages.
    #[arg(long)]
    pub name: Option<String>,

    /// Peers to connect to at startup, e.g.: --peers 192.168.1.10:8080
    #[arg(long)]
    pub peers: Vec<std::net::SocketAddr>,
}

impl Args {
    /// `--no-auto-connect` wins over `--auto-connect true`.
    pub fn auto_connect_enabled(&self) -> bool {
        self.auto_connect && !self.no_auto_connect
    }

    /// Configured display name, or a generated one.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!(
                "user-{}",
                crate::models::message::unix_timestamp_now() % 10_000
            ),
        }
    }
}
