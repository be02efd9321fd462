use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::RelayConfig;
use crate::server;

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Runs the auction relay server.
    Serve {
        /// Address to bind the WebSocket/HTTP listener on.
        #[arg(short, long, default_value = "0.0.0.0:8080")]
        listen: String,

        /// Minimum allowed gap between a new bid and the prior highest, per room.
        #[arg(long, default_value_t = 1.0)]
        min_increment: f64,

        /// Per-session outbound queue depth.
        #[arg(long, default_value_t = 256)]
        queue_capacity: usize,

        /// Maximum size in bytes of a single inbound WebSocket frame/message.
        #[arg(long, default_value_t = 1024)]
        max_frame_size: usize,

        /// Seconds of inbound silence before a session is considered idle.
        #[arg(long, default_value_t = 60)]
        read_idle_secs: u64,

        /// Seconds allowed for a single outbound frame write.
        #[arg(long, default_value_t = 10)]
        write_deadline_secs: u64,

        /// Seconds between reaper sweeps of empty rooms.
        #[arg(long, default_value_t = 60)]
        reaper_interval_secs: u64,
    },
}

impl Default for Args {
    fn default() -> Self {
        Self::new()
    }
}

impl Args {
    pub fn new() -> Self {
        Self::parse()
    }

    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        match &self.command {
            Some(Commands::Serve {
                listen,
                min_increment,
                queue_capacity,
                max_frame_size,
                read_idle_secs,
                write_deadline_secs,
                reaper_interval_secs,
            }) => {
                let config = RelayConfig {
                    listen_addr: listen.clone(),
                    min_increment: *min_increment,
                    queue_capacity: *queue_capacity,
                    max_frame_size: *max_frame_size,
                    read_idle: Duration::from_secs(*read_idle_secs),
                    write_deadline: Duration::from_secs(*write_deadline_secs),
                    reaper_interval: Duration::from_secs(*reaper_interval_secs),
                };
                server::serve(config).await
            }
            None => server::serve(RelayConfig::default()).await,
        }
    }
}
