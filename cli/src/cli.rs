use std::path::PathBuf;

#[derive(Debug, clap::Parser)]
#[clap(name = "dbt-generator", version, author)]
pub struct Args {
    /// The request document written by the invoking tool
    pub input: PathBuf,

    /// Where to write the response document
    pub output: PathBuf,

    /// Log more details (-v for debug, -vv for trace)
    #[clap(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
