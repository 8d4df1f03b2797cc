use clap::{Parser, Subcommand};

/// ClassHub Central — notifications and chat assistants
#[derive(Parser)]
#[command(name = "classhub", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to bind (defaults to CLASSHUB_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Post a notification
    Notify {
        #[arg(long)]
        message: String,
        /// Free-form tag, e.g. announcement, assignment, grade
        #[arg(long = "type", default_value = "general")]
        kind: String,
        #[arg(long)]
        link: Option<String>,
    },

    /// Sign a session in and print its notification feed
    Feed {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "student")]
        role: String,
        /// Mark one notification as read
        #[arg(long, conflicts_with = "mark_all")]
        mark: Option<String>,
        /// Mark every unread notification as read
        #[arg(long)]
        mark_all: bool,
        /// Keep printing updates until interrupted
        #[arg(long)]
        follow: bool,
    },

    /// Ask an assistant one question
    Chat {
        /// general or resources
        #[arg(short, long, default_value = "general")]
        assistant: String,
        message: String,
    },
}
