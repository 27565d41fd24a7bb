mod ambient;
mod cli;
mod models;
mod selection;
mod settings;
mod storage;
mod tags;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task;
use tracing::{info, warn};

use ambient::{AmbientColorUseCase, GattToolLight, ImageProbe};
use cli::{CliArgs, Command, TagCommand};
use models::{MediaItem, MediaType};
use selection::{MediaListSubscription, MediaSelectionPipeline};
use settings::SettingsService;
use storage::{FileAccess, LocalFileAccess};
use tags::TagMatrixEngine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ambient_gallery=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::from_env()?;
    if args.help {
        print!("{}", cli::USAGE);
        return Ok(());
    }

    let settings = match &args.settings_path {
        Some(path) => SettingsService::open(path),
        None => SettingsService::open_default()?,
    };
    info!(path = ?settings.path(), "Using settings");

    if let Some(edit) = args.settings_edit(&settings.read_settings()) {
        settings
            .apply_editable(&edit)
            .context("Failed to save settings")?;
        info!("Settings updated");
    }

    let file_access: Arc<dyn FileAccess> = Arc::new(LocalFileAccess::new());
    let engine = Arc::new(TagMatrixEngine::new(&settings, Arc::clone(&file_access)));
    info!(path = ?engine.csv_path(), "Tag matrix ready");

    let ambient = AmbientColorUseCase::new(
        Arc::new(ImageProbe::new()),
        Arc::new(GattToolLight::new()),
        settings.clone(),
    );

    if let Some(command) = &args.tag {
        return set_tag(&engine, command).await;
    }

    if let Some(index) = args.light_preset {
        let color = ambient
            .dispatch_preset(index)
            .with_context(|| format!("No color preset at index {index}"))?;
        println!("{color}");
        return Ok(());
    }

    let params = args.selection_params(&settings.read_settings());
    let seed = args.seed.unwrap_or_else(rand::random);
    info!(albums = ?params.album_names, sort = %params.sorting_type, seed, "Selecting media");

    let pipeline = MediaSelectionPipeline::new(settings.clone(), file_access, Arc::clone(&engine));
    let subscription = pipeline.execute(params, seed);

    let result = follow(&args, &engine, &ambient, subscription).await;

    let flush_engine = Arc::clone(&engine);
    task::spawn_blocking(move || flush_engine.flush()).await?;
    result
}

/// Applies one `--tag` request and waits for it to be saved.
async fn set_tag(engine: &Arc<TagMatrixEngine>, command: &TagCommand) -> Result<()> {
    let mut write_errors = engine.watch_write_errors();
    engine.set_tag_hit_for_path(&command.path, &command.tag, command.is_hit);

    let flush_engine = Arc::clone(engine);
    task::spawn_blocking(move || flush_engine.flush()).await?;

    if let Ok(failure) = write_errors.try_recv() {
        bail!("Failed to save tags to {:?}: {}", failure.path, failure.error);
    }

    let tags = engine.watch_tags_for(&models::filename_stem(&command.path)).current();
    println!(
        "{}: {}",
        command.path.display(),
        tags.into_iter().collect::<Vec<_>>().join(", ")
    );
    Ok(())
}

/// Prints every published list and handles typed commands until quit.
async fn follow(
    args: &CliArgs,
    engine: &TagMatrixEngine,
    ambient: &AmbientColorUseCase,
    mut subscription: MediaListSubscription,
) -> Result<()> {
    let mut write_errors = engine.watch_write_errors();
    let mut all_tags = engine.watch_all_tags();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = !args.once;
    let mut sent_ambient = false;

    loop {
        tokio::select! {
            list = subscription.changed() => {
                let Some(list) = list else { break };
                if list.first().map(|i| i.media_type) == Some(MediaType::Loading) {
                    continue;
                }
                print_list(engine, &list, subscription.seed());

                if args.ambient && !sent_ambient {
                    sent_ambient = true;
                    if let Some(first) = list.first() {
                        send_ambient(ambient, first).await;
                    }
                }
                if args.once {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    stdin_open = false;
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => run_command(command, engine, ambient, &subscription).await,
                    Err(e) => println!("{e:#}"),
                }
            }
            Some(tags) = all_tags.changed(), if !args.once => {
                println!("tags: {}", tags.join(", "));
            }
            Ok(failure) = write_errors.recv() => {
                warn!(path = ?failure.path, error = %failure.error, "Tags were not saved");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    Ok(())
}

async fn run_command(
    command: Command,
    engine: &TagMatrixEngine,
    ambient: &AmbientColorUseCase,
    subscription: &MediaListSubscription,
) {
    let list = subscription.current();
    let item_at = |index: usize| list.get(index).filter(|i| !i.is_placeholder());

    match command {
        Command::Sort(sort) => subscription.update_params(|p| p.sorting_type = sort),
        Command::SwitchTag(tag, toggle_exclusion) => {
            subscription.update_params(|p| p.switch_tag(&tag, toggle_exclusion))
        }
        Command::IncludeAll => {
            let tags = engine.watch_all_tags().current();
            subscription.update_params(|p| p.include_all(&tags));
        }
        Command::ExcludeAll => {
            let tags = engine.watch_all_tags().current();
            subscription.update_params(|p| p.exclude_all(&tags));
        }
        Command::ClearTags => subscription.update_params(|p| p.clear_tags()),
        Command::Tags(index) => match item_at(index) {
            Some(item) => {
                for hit in engine.watch_tag_hits(&item.path).current() {
                    println!("  [{}] {}", if hit.is_hit { 'x' } else { ' ' }, hit.name);
                }
            }
            None => println!("No item {index}"),
        },
        Command::Hit(index, tag, is_hit) => match item_at(index) {
            Some(item) => engine.set_tag_hit_for_path(&item.path, &tag, is_hit),
            None => println!("No item {index}"),
        },
        Command::Ambient(index) => match item_at(index) {
            Some(item) => send_ambient(ambient, item).await,
            None => println!("No item {index}"),
        },
        Command::Reload => match engine.refresh().await {
            Ok(changed) => println!("Reloaded tags (changed: {changed})"),
            Err(e) => println!("{e}"),
        },
        Command::Help => print!("{}", cli::COMMANDS),
        Command::Quit => {}
    }
}

async fn send_ambient(ambient: &AmbientColorUseCase, item: &MediaItem) {
    match ambient.execute(item).await {
        Some(color) => println!("ambient {color}"),
        None => println!("ambient: no color for {}", item.path.display()),
    }
}

fn print_list(engine: &TagMatrixEngine, list: &[MediaItem], seed: u64) {
    if list.first().map(|i| i.media_type) == Some(MediaType::None) {
        println!("(no media)");
        return;
    }

    let matrix = engine.current();
    println!("{} items (seed {seed})", list.len());
    for (index, item) in list.iter().enumerate() {
        let tags = matrix.tags_for(&item.stem());
        if tags.is_empty() {
            println!("{index:>4} {:<5} {}", item.media_type.as_str(), item.path.display());
        } else {
            let tags: Vec<_> = tags.into_iter().collect();
            println!(
                "{index:>4} {:<5} {} [{}]",
                item.media_type.as_str(),
                item.path.display(),
                tags.join(", ")
            );
        }
    }
}
