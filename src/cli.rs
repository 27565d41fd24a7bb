//! Command-line arguments and interactive follow-mode commands.

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::models::{MediaSelectionParams, MediaType, SortingType};
use crate::settings::{EditableSettings, Settings};

pub const USAGE: &str = "\
Usage: ambient-gallery [OPTIONS]

Selection:
  --album NAME           Album to show (repeatable, default: all configured)
  --type TYPE            image, gif or video (repeatable, default: all)
  --sort ORDER           random, date-new, date-old, name-az, name-za,
                         size-small or size-big (default: random)
  --include TAG          Require a tag (repeatable)
  --exclude TAG          Reject a tag (repeatable)
  --seed N               Random order seed

Modes:
  --once                 Print the first list and exit
  --tag PATH TAG on|off  Set one tag on one file and exit
  --ambient              Send the first item's ambient color to the lights
  --light-preset N       Send color preset N to the lights and exit

Settings:
  --settings PATH        Settings file (default: user config dir)
  --set-folder PATH      Replace album folders (repeatable)
  --set-csv PATH         Replace the tags CSV path
  --set-light MAC        Replace light addresses (repeatable)
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCommand {
    pub path: PathBuf,
    pub tag: String,
    pub is_hit: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub albums: Vec<String>,
    pub media_types: Vec<MediaType>,
    pub sort: SortingType,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub seed: Option<u64>,
    pub once: bool,
    pub tag: Option<TagCommand>,
    pub ambient: bool,
    pub light_preset: Option<usize>,
    pub settings_path: Option<PathBuf>,
    pub set_folders: Vec<PathBuf>,
    pub set_csv: Option<PathBuf>,
    pub set_lights: Vec<String>,
    pub help: bool,
}

impl CliArgs {
    pub fn from_env() -> Result<Self> {
        Self::parse(env::args().skip(1))
    }

    pub fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut parsed = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--album" => {
                    let value = args.next().context("Missing value for --album")?;
                    parsed.albums.push(value);
                }
                "--type" => {
                    let value = args.next().context("Missing value for --type")?;
                    let media_type = match value.as_str() {
                        "image" => MediaType::Image,
                        "gif" => MediaType::Gif,
                        "video" => MediaType::Video,
                        other => bail!("Unknown media type: {other}"),
                    };
                    parsed.media_types.push(media_type);
                }
                "--sort" => {
                    let value = args.next().context("Missing value for --sort")?;
                    parsed.sort = value
                        .parse()
                        .map_err(anyhow::Error::msg)
                        .context("Failed to parse --sort")?;
                }
                "--include" => {
                    let value = args.next().context("Missing value for --include")?;
                    parsed.include.push(value);
                }
                "--exclude" => {
                    let value = args.next().context("Missing value for --exclude")?;
                    parsed.exclude.push(value);
                }
                "--seed" => {
                    let value = args.next().context("Missing value for --seed")?;
                    parsed.seed = Some(
                        value
                            .parse::<u64>()
                            .context("Failed to parse --seed as a non-negative integer")?,
                    );
                }
                "--once" => parsed.once = true,
                "--tag" => {
                    let path = args.next().context("Missing path for --tag")?;
                    let tag = args.next().context("Missing tag for --tag")?;
                    let state = args.next().context("Missing on|off for --tag")?;
                    parsed.tag = Some(TagCommand {
                        path: PathBuf::from(path),
                        tag,
                        is_hit: parse_switch(&state)?,
                    });
                }
                "--ambient" => parsed.ambient = true,
                "--light-preset" => {
                    let value = args.next().context("Missing value for --light-preset")?;
                    parsed.light_preset = Some(
                        value
                            .parse::<usize>()
                            .context("Failed to parse --light-preset as an index")?,
                    );
                }
                "--settings" => {
                    let value = args.next().context("Missing value for --settings")?;
                    parsed.settings_path = Some(PathBuf::from(value));
                }
                "--set-folder" => {
                    let value = args.next().context("Missing value for --set-folder")?;
                    parsed.set_folders.push(PathBuf::from(value));
                }
                "--set-csv" => {
                    let value = args.next().context("Missing value for --set-csv")?;
                    parsed.set_csv = Some(PathBuf::from(value));
                }
                "--set-light" => {
                    let value = args.next().context("Missing value for --set-light")?;
                    parsed.set_lights.push(value);
                }
                "-h" | "--help" => parsed.help = true,
                other => bail!("Unknown argument: {other}"),
            }
        }

        Ok(parsed)
    }

    /// Settings edits requested on the command line, if any.
    pub fn settings_edit(&self, current: &Settings) -> Option<EditableSettings> {
        if self.set_folders.is_empty() && self.set_csv.is_none() && self.set_lights.is_empty() {
            return None;
        }

        let mut editable = EditableSettings::from_settings(current);
        if !self.set_folders.is_empty() {
            editable.album_paths = join_lines(self.set_folders.iter().map(|p| p.display()));
        }
        if let Some(csv) = &self.set_csv {
            editable.tags_csv_path = csv.display().to_string();
        }
        if !self.set_lights.is_empty() {
            editable.mac_addresses = self.set_lights.join("\n");
        }
        Some(editable)
    }

    /// Selection params, defaulting to every configured album and media type.
    pub fn selection_params(&self, settings: &Settings) -> MediaSelectionParams {
        let albums = if self.albums.is_empty() {
            settings.album_viewing.album_names()
        } else {
            self.albums.clone()
        };
        let media_types = if self.media_types.is_empty() {
            MediaType::selectable().to_vec()
        } else {
            self.media_types.clone()
        };

        let params = MediaSelectionParams::new(albums, media_types, self.sort);
        let params = self.include.iter().fold(params, |p, tag| p.with_included(tag));
        self.exclude.iter().fold(params, |p, tag| p.with_excluded(tag))
    }
}

fn join_lines<T: ToString>(items: impl Iterator<Item = T>) -> String {
    items.map(|i| i.to_string()).collect::<Vec<_>>().join("\n")
}

fn parse_switch(value: &str) -> Result<bool> {
    match value {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        other => bail!("Expected on or off, got {other}"),
    }
}

/// One line typed while following the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Sort(SortingType),
    /// Cycle a tag; `true` toggles exclusion instead of inclusion.
    SwitchTag(String, bool),
    IncludeAll,
    ExcludeAll,
    ClearTags,
    /// Show the tags of the item at an index.
    Tags(usize),
    /// Set or clear a tag on the item at an index.
    Hit(usize, String, bool),
    Ambient(usize),
    Reload,
    Help,
    Quit,
}

pub const COMMANDS: &str = "\
Commands:
  sort ORDER            change the sort order
  tag NAME              include a tag, or clear it
  exclude NAME          exclude a tag, or clear it
  all | none | clear    include all, exclude all, or clear every tag
  tags N                show the tags of item N
  hit N TAG on|off      set a tag on item N
  ambient N             send item N's color to the lights
  reload                re-read the tags CSV
  quit
";

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            bail!("Empty command");
        };

        let mut next = |what: &str| words.next().with_context(|| format!("Missing {what}"));
        let command = match name {
            "sort" => Self::Sort(
                next("sort order")?
                    .parse()
                    .map_err(anyhow::Error::msg)?,
            ),
            "tag" => Self::SwitchTag(next("tag")?.to_string(), false),
            "exclude" => Self::SwitchTag(next("tag")?.to_string(), true),
            "all" => Self::IncludeAll,
            "none" => Self::ExcludeAll,
            "clear" => Self::ClearTags,
            "tags" => Self::Tags(parse_index(next("index")?)?),
            "hit" => {
                let index = parse_index(next("index")?)?;
                let tag = next("tag")?.to_string();
                let is_hit = parse_switch(next("on|off")?)?;
                Self::Hit(index, tag, is_hit)
            }
            "ambient" => Self::Ambient(parse_index(next("index")?)?),
            "reload" => Self::Reload,
            "help" | "?" => Self::Help,
            "quit" | "q" | "exit" => Self::Quit,
            other => bail!("Unknown command: {other}"),
        };
        Ok(command)
    }
}

fn parse_index(value: &str) -> Result<usize> {
    value
        .parse::<usize>()
        .with_context(|| format!("Not an item index: {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Result<CliArgs> {
        CliArgs::parse(line.split_whitespace().map(str::to_string))
    }

    #[test]
    fn test_parse_selection_flags() {
        let parsed = args(
            "--album trip --album home --type gif --sort size-big --include a --exclude b --seed 7 --once",
        )
        .unwrap();

        assert_eq!(parsed.albums, ["trip", "home"]);
        assert_eq!(parsed.media_types, [MediaType::Gif]);
        assert_eq!(parsed.sort, SortingType::SizeBigToSmall);
        assert_eq!(parsed.seed, Some(7));
        assert!(parsed.once);

        let params = parsed.selection_params(&Settings::default());
        assert!(params.included_tags().contains("a"));
        assert!(params.excluded_tags().contains("b"));
        assert_eq!(params.album_names, ["trip", "home"]);
    }

    #[test]
    fn test_parse_tag_command() {
        let parsed = args("--tag /photos/img001.jpg beach off").unwrap();
        assert_eq!(
            parsed.tag,
            Some(TagCommand {
                path: PathBuf::from("/photos/img001.jpg"),
                tag: "beach".to_string(),
                is_hit: false,
            })
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(args("--album").is_err());
        assert!(args("--sort sideways").is_err());
        assert!(args("--type audio").is_err());
        assert!(args("--tag /a.jpg beach maybe").is_err());
        assert!(args("--bogus").is_err());
    }

    #[test]
    fn test_default_params_use_all_albums() {
        let mut settings = Settings::default();
        settings.album_viewing.folder_paths =
            vec![PathBuf::from("/photos/trip"), PathBuf::from("/photos/home")];

        let params = args("").unwrap().selection_params(&settings);
        assert_eq!(params.album_names, ["trip", "home"]);
        assert_eq!(params.media_types.len(), 3);
        assert_eq!(params.sorting_type, SortingType::Random);
    }

    #[test]
    fn test_settings_edit() {
        let settings = Settings::default();
        assert!(args("").unwrap().settings_edit(&settings).is_none());

        let edit = args("--set-folder /a/trip --set-folder /b/home --set-light AA:BB")
            .unwrap()
            .settings_edit(&settings)
            .unwrap();
        assert_eq!(edit.album_paths, "/a/trip\n/b/home");
        assert_eq!(edit.mac_addresses, "AA:BB");
        assert_eq!(
            edit.tags_csv_path,
            settings.album_viewing.tags_csv_path.display().to_string()
        );
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("sort name-az").unwrap(),
            Command::Sort(SortingType::NameAToZ)
        );
        assert_eq!(
            Command::parse("exclude family").unwrap(),
            Command::SwitchTag("family".to_string(), true)
        );
        assert_eq!(
            Command::parse("hit 2 beach on").unwrap(),
            Command::Hit(2, "beach".to_string(), true)
        );
        assert_eq!(Command::parse("  q ").unwrap(), Command::Quit);
        assert!(Command::parse("hit x beach on").is_err());
        assert!(Command::parse("tags").is_err());
        assert!(Command::parse("").is_err());
    }
}
