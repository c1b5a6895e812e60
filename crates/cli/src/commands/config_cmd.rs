//! `parley config`: Show or initialize the configuration.

use parley_config::AppConfig;

pub fn run(init: bool, print_default: bool) -> Result<(), Box<dyn std::error::Error>> {
    let path = AppConfig::config_dir().join("config.toml");

    if print_default {
        println!("# {}", path.display());
        print!("{}", AppConfig::default_toml());
        return Ok(());
    }

    if init {
        if path.exists() {
            println!("  Config already exists at {}", path.display());
        } else {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(&path, AppConfig::default_toml())?;
            println!("  Wrote default config to {}", path.display());
        }
        return Ok(());
    }

    match AppConfig::load() {
        Ok(config) => {
            println!("  Config:    {}", path.display());
            println!("  Model:     {}", config.model.model);
            println!("  Strategy:  {:?}", config.context_strategy);
            println!(
                "  API key:   {}",
                if config.has_api_key() { "set" } else { "missing" }
            );
            if let Some(proxy) = &config.endpoint.reverse_proxy {
                println!("  Proxy:     {proxy}");
            }
            if config.endpoint.use_openrouter {
                println!("  Routing:   OpenRouter");
            }
            println!(
                "  Titles:    {}",
                if config.title.enabled {
                    config.title.model.as_str()
                } else {
                    "disabled"
                }
            );
        }
        Err(e) => {
            println!("  Config error: {e}");
            return Err(e.into());
        }
    }
    Ok(())
}
