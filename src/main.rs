use std::process;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use log::error;

use kappa_ensemble::{run_ensemble_analysis, Args, RenderConfig, RunParams};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => match e.kind() {
            // Too few arguments: usage on stderr, exit -1
            ErrorKind::MissingRequiredArgument
            | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                let mut cmd = Args::command();
                eprintln!("{}", cmd.render_long_help());
                eprintln!("{}", e);
                process::exit(-1);
            }
            _ => e.exit(),
        },
    };

    let params = match RunParams::try_from(&args) {
        Ok(params) => params,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };
    let render = RenderConfig::from_args(&args);

    if let Err(e) = run_ensemble_analysis(&params, &render) {
        error!("{:#}", e);
        process::exit(1);
    }
}
