use clap::Parser;
use color_eyre::{
    Result,
    eyre::{WrapErr as _, eyre},
};
use comfyui_agent::{
    Config, Plugin,
    config::{config_path, save_ron_file},
    functions,
};
use log::info;
use serde_json::Value;

use crate::cli::{Cli, Command};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();
    color_eyre::install()?;
    let cli = Cli::parse();
    let mut cfg = Config::load()?;
    cli.apply_overrides(&mut cfg);

    let output = match cli.command {
        Command::Functions => functions::get_functions(),
        Command::InitConfig => {
            let path = config_path()?;
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            save_ron_file(&path, &cfg)?;
            indoc::printdoc! {"
                Wrote {}
                Environment variables and flags still take precedence over it.
                ",
                path.display()
            };
            return Ok(());
        }
        Command::Generate(args) => {
            let plugin = Plugin::new(cfg)?;
            serde_json::to_value(plugin.generate_image(args.into()).await)?
        }
        Command::Analyze(args) => {
            let plugin = Plugin::new(cfg)?;
            serde_json::to_value(
                plugin
                    .analyze_image(&args.image_path, &args.description)
                    .await,
            )?
        }
        Command::Call(call) => {
            let args: Value = serde_json::from_str(&call.args)
                .wrap_err_with(|| format!("Arguments aren't valid JSON: {}", call.args))?;
            let plugin = Plugin::new(cfg)?;
            info!("Calling {} with {args}", call.name);
            plugin.call(&call.name, args).await
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    if output["success"] == false {
        return Err(eyre!("Call failed"));
    }
    Ok(())
}
