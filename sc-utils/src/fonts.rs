use anyhow::{bail, Context, Error};
use log::{info, warn};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

const FONT_EXTENSIONS: [&str; 3] = ["ttf", "otf", "ttc"];

/// Directories searched by [`find_system_fonts`].
pub fn system_font_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![
        PathBuf::from("/usr/share/fonts"),
        PathBuf::from("/usr/local/share/fonts"),
        PathBuf::from("/Library/Fonts"),
        PathBuf::from("/System/Library/Fonts"),
        PathBuf::from("C:\\Windows\\Fonts"),
    ];
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        dirs.push(home.join(".fonts"));
        dirs.push(home.join(".local/share/fonts"));
        dirs.push(home.join("Library/Fonts"));
    }
    dirs
}

fn is_font_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| FONT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Font files found recursively under `dirs`, sorted by path. Symlinks are
/// not followed and unreadable entries are skipped.
pub fn find_fonts_in<P: AsRef<Path>>(dirs: &[P]) -> Vec<PathBuf> {
    let mut fonts = dirs
        .iter()
        .flat_map(|dir| WalkDir::new(dir).follow_links(false))
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && is_font_file(entry.path()))
        .map(DirEntry::into_path)
        .collect::<Vec<_>>();
    fonts.sort();
    fonts.dedup();
    fonts
}

/// Font files installed in the standard system and user font directories.
pub fn find_system_fonts() -> Vec<PathBuf> {
    find_fonts_in(&system_font_dirs())
}

/// First font in `fonts` whose full path contains `name`, ignoring case.
pub fn find_font<'a>(fonts: &'a [PathBuf], name: &str) -> Option<&'a PathBuf> {
    let needle = name.to_lowercase();
    fonts
        .iter()
        .find(|p| p.to_string_lossy().to_lowercase().contains(&needle))
}

/// Fonts made available to figure rendering, and the default family.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FontRegistry {
    fonts: Vec<PathBuf>,
    default_family: Option<String>,
}

impl FontRegistry {
    /// Empty registry.
    pub fn new() -> FontRegistry {
        FontRegistry::default()
    }

    /// Register the font file at `path` and return its family name (the file
    /// stem). Fails if the file does not exist.
    pub fn add_font(&mut self, path: impl AsRef<Path>) -> Result<String, Error> {
        let path = path.as_ref();
        if !path.is_file() {
            bail!("font file {} does not exist", path.display());
        }
        let family = path
            .file_stem()
            .and_then(|s| s.to_str())
            .with_context(|| format!("font file {} has no usable name", path.display()))?
            .to_string();
        if !self.fonts.iter().any(|f| f == path) {
            self.fonts.push(path.to_path_buf());
        }
        Ok(family)
    }

    /// Make `family` the default for new figures.
    pub fn set_default_family(&mut self, family: impl Into<String>) {
        self.default_family = Some(family.into());
    }

    /// Registered font files, in registration order.
    pub fn fonts(&self) -> &[PathBuf] {
        &self.fonts
    }

    /// Default family, if one was set.
    pub fn default_family(&self) -> Option<&str> {
        self.default_family.as_deref()
    }
}

/// Register Arial and make it the default family: the first installed font
/// whose path mentions "arial", or else the font file at `fallback`. Returns
/// the registered path.
pub fn configure_arial(registry: &mut FontRegistry, fallback: &Path) -> Result<PathBuf, Error> {
    configure_arial_from(registry, &find_system_fonts(), fallback)
}

fn configure_arial_from(registry: &mut FontRegistry, fonts: &[PathBuf], fallback: &Path) -> Result<PathBuf, Error> {
    let path = match find_font(fonts, "arial") {
        Some(found) => {
            info!("Found Arial font at {}", found.display());
            found.clone()
        }
        None => {
            warn!("Arial font not found, using {}", fallback.display());
            fallback.to_path_buf()
        }
    };
    let family = registry
        .add_font(&path)
        .context("could not register the Arial font")?;
    registry.set_default_family(family);
    Ok(path)
}
