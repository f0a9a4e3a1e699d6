use clap::{Parser, Subcommand};

/// Service broker provisioning WSO2 API Manager applications and subscriptions
#[derive(Parser)]
#[command(name = "apim-broker", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the broker server
    Serve {
        /// Port to bind (defaults to the configured server port)
        #[arg(short, long, env = "APIM_BROKER_PORT")]
        port: Option<u16>,
    },

    /// Print the service catalog as JSON
    Catalog,

    /// Apply database migrations and exit
    Migrate,
}
