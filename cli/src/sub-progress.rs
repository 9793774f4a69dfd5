use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use lib_subscribe::progress::KEY_FROM_BEGINNING;
use lib_subscribe::{ConfigOverrides, ProgressStore, load_config};

/// Inspect and reset the progress files of client-side subscriptions.
#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = "Lists, prints or deletes the per-topic progress files kept under <data-dir>/subscribe. The data directory is resolved the same way the subscription engine resolves it: defaults, then the JSON config file, then environment variables and flags."
)]
struct Args {
    #[command(flatten)]
    config: ConfigOverrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every topic that has a progress file.
    List,
    /// Print the recorded SQL and per-table positions of a topic.
    Show {
        /// Subscription topic.
        topic: String,
        /// Print the progress file as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Delete a topic's progress file so the next subscription starts fresh.
    Reset {
        /// Subscription topic.
        topic: String,
    },
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = load_config(args.config).context("resolving configuration")?;
    let store = config.progress_store();

    match args.command {
        Command::List => print!("{}", render_list(&store)?),
        Command::Show { topic, json } => print!("{}", render_show(&store, &topic, json)?),
        Command::Reset { topic } => {
            store
                .remove(&topic)
                .with_context(|| format!("resetting topic {}", topic))?;
            println!("{} progress of '{}' removed", "ok".green(), topic);
        }
    }

    Ok(())
}

fn render_list(store: &ProgressStore) -> anyhow::Result<String> {
    let topics = store.list_topics()?;
    if topics.is_empty() {
        return Ok(format!("no progress files in {}\n", store.dir().display()));
    }

    let mut out = String::new();
    for topic in topics {
        match store.read(&topic)? {
            Some(file) => out.push_str(&format!(
                "{}  {} tables  {}\n",
                topic.bold(),
                file.progress.len(),
                file.sql
            )),
            None => continue,
        }
    }
    Ok(out)
}

fn render_show(store: &ProgressStore, topic: &str, json: bool) -> anyhow::Result<String> {
    let Some(file) = store.read(topic)? else {
        bail!("no progress recorded for topic '{}'", topic);
    };

    if json {
        return Ok(format!("{}\n", serde_json::to_string_pretty(&file)?));
    }

    let mut out = format!("{} {}\n", "sql:".bold(), file.sql);
    for entry in &file.progress {
        let key = if entry.key == KEY_FROM_BEGINNING {
            "from beginning".to_string()
        } else {
            entry.key.to_string()
        };
        out.push_str(&format!("  uid {:>20}  key {}\n", entry.uid, key));
    }
    if file.truncated {
        out.push_str(&format!(
            "{}\n",
            "warning: reading stopped at a malformed line".yellow()
        ));
    }
    Ok(out)
}
