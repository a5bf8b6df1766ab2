use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "hdal",
    about = "Inspect and edit hybrid DAL objects stored in a JSON data file",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML file declaring the types
    #[arg(short, long, global = true, default_value = "schema.toml")]
    pub schema: PathBuf,

    /// JSON file holding the persistent store
    #[arg(short, long, global = true, default_value = "data.json")]
    pub data: PathBuf,

    /// Optional TOML file with DAL tunables
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Raise log verbosity (repeatable)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the resolved types of the schema
    Schema,
    /// Create an object and print its guid
    Create(CreateArgs),
    /// Show one object
    Show(ShowArgs),
    /// Change fields of an object
    Set(SetArgs),
    /// Delete an object
    Delete(DeleteArgs),
    /// List objects of a type, optionally filtered and sorted
    List(ListArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    pub type_name: String,
    /// `field=value` pairs; values are JSON, falling back to plain text
    pub fields: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    pub type_name: String,
    pub guid: String,
    /// Nest related objects this many levels deep
    #[arg(long, default_value = "0")]
    pub depth: usize,
}

#[derive(Args, Debug)]
pub struct SetArgs {
    pub type_name: String,
    pub guid: String,
    #[arg(required = true)]
    pub fields: Vec<String>,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    pub type_name: String,
    pub guid: String,
    /// Detach children of this reverse relation instead of refusing
    #[arg(long)]
    pub abandon: Vec<String>,
    /// Detach children of every reverse relation
    #[arg(long, conflicts_with = "abandon")]
    pub abandon_all: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    pub type_name: String,
    /// `field=value` equality filters, combined with AND
    #[arg(short = 'w', long = "where")]
    pub filters: Vec<String>,
    /// Sort on a field path
    #[arg(long)]
    pub sort: Option<String>,
    #[arg(long, requires = "sort")]
    pub reverse: bool,
}
