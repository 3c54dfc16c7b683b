use super::toml::{ConfigToml, DATA_DIR_PREFIX};
use anyhow::{Context as _, bail};
use config::{ConfigBuilder, Environment, File, FileFormat, builder::AsyncState};
use directories::{BaseDirs, ProjectDirs};
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt as _;
use tracing::{info, warn};

pub(crate) const HERALD_DEFAULT_TOML: &str = include_str!("../../herald-default.toml");
const HERALD_TOML: &str = "herald.toml";

// Path prefixes
const HOME_DIR_PREFIX: &str = "~/";
const CACHE_DIR_PREFIX: &str = "${CACHE_DIR}/";
const CONFIG_DIR_PREFIX: &str = "${CONFIG_DIR}/";

pub(crate) struct PathPrefixes {
    pub(crate) project_dirs: Option<ProjectDirs>,
    pub(crate) base_dirs: Option<BaseDirs>,
}

impl PathPrefixes {
    pub(crate) fn replace_file_prefix(&self, input_path: &str) -> PathBuf {
        if let (Some(project_dirs), Some(base_dirs)) = (&self.project_dirs, &self.base_dirs) {
            if let Some(suffix) = input_path.strip_prefix(HOME_DIR_PREFIX) {
                base_dirs.home_dir().join(suffix)
            } else if let Some(suffix) = input_path.strip_prefix(DATA_DIR_PREFIX) {
                project_dirs.data_dir().join(suffix)
            } else if let Some(suffix) = input_path.strip_prefix(CACHE_DIR_PREFIX) {
                project_dirs.cache_dir().join(suffix)
            } else if let Some(suffix) = input_path.strip_prefix(CONFIG_DIR_PREFIX) {
                project_dirs.config_dir().join(suffix)
            } else {
                PathBuf::from(input_path)
            }
        } else {
            if input_path.starts_with(HOME_DIR_PREFIX)
                || input_path.starts_with(DATA_DIR_PREFIX)
                || input_path.starts_with(CACHE_DIR_PREFIX)
                || input_path.starts_with(CONFIG_DIR_PREFIX)
            {
                warn!("Not expanding prefix of `{input_path}`");
            }
            PathBuf::from(input_path)
        }
    }

    /// Expands the prefix and creates the parent directory of the file.
    pub(crate) async fn replace_file_prefix_mkdir_parent(
        &self,
        input_path: &str,
    ) -> Result<PathBuf, anyhow::Error> {
        let path = self.replace_file_prefix(input_path);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create directory {parent:?}"))?;
        }
        Ok(path)
    }

    pub(crate) async fn replace_path_prefix_mkdir(
        &self,
        dir: &str,
    ) -> Result<PathBuf, anyhow::Error> {
        let path = self.replace_file_prefix(dir);
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("cannot create directory {path:?}"))?;
        Ok(path)
    }
}

pub(crate) struct ConfigHolder {
    herald_toml: Option<PathBuf>,
    pub(crate) path_prefixes: PathPrefixes,
}

impl ConfigHolder {
    pub(crate) async fn generate_default_config(
        dst: Option<PathBuf>,
        overwrite: bool,
    ) -> Result<(), anyhow::Error> {
        let dst = dst.unwrap_or(PathBuf::from(HERALD_TOML));

        let mut file = OpenOptions::new()
            .write(true)
            .create(true) // Always allow creating new files.
            .truncate(true) // Truncate existing files.
            .create_new(!overwrite) // if true, `create` is ignored, and only new file creation is allowed, meaning overwriting is disabled.
            .open(&dst)
            .await
            .with_context(|| {
                format!(
                    "cannot open {dst:?} for writing{}",
                    if !overwrite {
                        ", try using `--overwrite`"
                    } else {
                        ""
                    }
                )
            })?;
        file.write_all(HERALD_DEFAULT_TOML.as_bytes())
            .await
            .with_context(|| format!("cannot write to {dst:?}"))?;
        println!("Generated {dst:?}");
        Ok(())
    }

    pub(crate) fn new(
        project_dirs: Option<ProjectDirs>,
        base_dirs: Option<BaseDirs>,
        config: Option<PathBuf>,
    ) -> Result<Self, anyhow::Error> {
        let herald_toml = if let Some(config) = config {
            if !config.try_exists().unwrap_or_default() {
                bail!("cannot find configuration file {config:?}");
            }
            Some(config)
        } else {
            let local = PathBuf::from(HERALD_TOML);
            if local.try_exists().unwrap_or_default() {
                info!("Using configuration file {local:?}");
                Some(local)
            } else {
                None
            }
        };
        Ok(Self {
            herald_toml,
            path_prefixes: PathPrefixes {
                project_dirs,
                base_dirs,
            },
        })
    }

    pub(crate) async fn load_config(&self) -> Result<ConfigToml, anyhow::Error> {
        let mut builder = ConfigBuilder::<AsyncState>::default();
        if let Some(herald_toml) = self.herald_toml.as_deref() {
            builder = builder.add_source(
                File::from(herald_toml)
                    .required(true)
                    .format(FileFormat::Toml),
            );
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("herald")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .await?;
        Ok(settings.try_deserialize()?)
    }
}
