use std::io::BufRead;

use clap::{Parser, ValueEnum};

use ordercast::config;
use ordercast::ids::{NodeId, PayloadId};
use ordercast::runtime::{self, PeerOptions, RoleHint};
use ordercast::telemetry;

#[derive(Parser, Debug)]
#[command(name = "ordercast", about = "Totally-ordered broadcast peer", version)]
struct Cli {
    /// Stable cluster-unique peer id; higher ids win elections.
    #[arg(long)]
    id: u32,

    /// Initial role hint; the actual role is decided by election.
    #[arg(long, value_enum)]
    role: Role,

    /// TCP port for the ordered record stream.
    #[arg(long = "tcp-port")]
    tcp_port: u16,

    /// Application sink: kitchen displays orders, waiter also submits them
    /// from stdin.
    #[arg(long, value_enum, default_value = "kitchen")]
    ui: Ui,

    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Role {
    Leader,
    Follower,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Ui {
    Kitchen,
    Waiter,
}

fn main() {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);

    let mut config = config::Config::default();
    config::apply_env_overrides(&mut config);

    let node_id = NodeId::new(cli.id);
    if !config.cluster.contains(&node_id) {
        eprintln!(
            "error: id {} is not in the cluster {:?}",
            cli.id,
            config.cluster.iter().map(|id| id.get()).collect::<Vec<_>>()
        );
        std::process::exit(1);
    }

    let peer = match runtime::start(PeerOptions {
        node_id,
        role_hint: match cli.role {
            Role::Leader => RoleHint::Leader,
            Role::Follower => RoleHint::Follower,
        },
        stream_port: cli.tcp_port,
        config,
        print_deliveries: true,
        delivery: None,
    }) {
        Ok(peer) => peer,
        Err(err) => {
            tracing::error!("peer start failed: {err}");
            std::process::exit(1);
        }
    };

    match cli.ui {
        Ui::Waiter => {
            println!("waiter: type an order and press enter");
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                let body = line.trim();
                if body.is_empty() {
                    continue;
                }
                peer.submit(PayloadId::mint(), body);
            }
        }
        Ui::Kitchen => {
            // Deliveries are printed by the runtime; just stay alive.
            loop {
                std::thread::sleep(std::time::Duration::from_secs(1));
            }
        }
    }

    peer.shutdown();
}
