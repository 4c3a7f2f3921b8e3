use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use vdisk_core::{
    BlobDirStore, BlobDirStoreConfig, ConfigError, ContentStore, Dispatcher, DispatcherOptions,
    FileSystemOps, PointerRecord, SharedTree, StoreError, TreeGateway, VdiskConfig,
};

/// Everything `vdisk mount` needs, after CLI flags are folded over the file config
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub mount_point: PathBuf,
    pub core: VdiskConfig,
    pub allow_other: bool,
    pub auto_unmount: bool,
    pub log_level: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from("/mnt/vdisk"),
            core: VdiskConfig::default(),
            allow_other: false,
            auto_unmount: true,
            log_level: "info".into(),
        }
    }
}

impl MountConfig {
    /// Build from the `mount` subcommand. Explicit flags win over the config file.
    pub fn from_args(
        path: PathBuf,
        config: Option<PathBuf>,
        store_dir: Option<PathBuf>,
        pointer: Option<PathBuf>,
        allow_other: bool,
        auto_unmount: bool,
        log_level: String,
    ) -> Result<Self, ConfigError> {
        let mut core = match config {
            Some(file) => VdiskConfig::from_file(&file)?,
            None => VdiskConfig::default(),
        };
        if let Some(dir) = store_dir {
            core.store_dir = dir;
        }
        if let Some(file) = pointer {
            core.pointer_path = file;
        }

        Ok(Self {
            mount_point: path,
            core,
            allow_other,
            auto_unmount,
            log_level,
        })
    }

    /// Open the object directory and wire the verb layer on top of it.
    pub async fn dispatcher(&self) -> Result<Arc<dyn FileSystemOps>, StoreError> {
        if let Some(parent) = self.core.pointer_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let store: Arc<dyn ContentStore> = Arc::new(
            BlobDirStore::new(BlobDirStoreConfig::new(&self.core.store_dir)).await?,
        );
        let gateway = TreeGateway::new(
            Arc::clone(&store),
            PointerRecord::new(&self.core.pointer_path),
            self.core.index_object_name.clone(),
        );
        let tree = SharedTree::new(gateway);
        Ok(Arc::new(Dispatcher::new(
            tree,
            store,
            DispatcherOptions::from(&self.core),
        )))
    }
}

#[derive(Parser)]
#[command(name = "vdisk", about = "Content-addressed object store as a FUSE filesystem")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Mount the store
    Mount {
        /// Mount point path
        path: PathBuf,
        /// JSON config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Object directory, overrides the config file
        #[arg(long)]
        store_dir: Option<PathBuf>,
        /// Pointer record file, overrides the config file
        #[arg(long)]
        pointer: Option<PathBuf>,
        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
        /// Automatically unmount when the process exits
        #[arg(long, default_value_t = true)]
        auto_unmount: bool,
        /// Log level (trace, debug, info, warn, error)
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Unmount the store
    Unmount {
        /// Mount point path
        path: PathBuf,
    },
    /// Show mount status
    Status {
        /// Mount point path
        path: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_flags_override_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("vdisk.json");
        std::fs::write(
            &file,
            r#"{ "store_dir": "/srv/objects", "pointer_path": "/srv/data.dat", "decrypt_locally": false }"#,
        )
        .unwrap();

        let config = MountConfig::from_args(
            dir.path().join("mnt"),
            Some(file),
            Some(dir.path().join("objects")),
            None,
            false,
            true,
            "debug".into(),
        )
        .unwrap();

        assert_eq!(config.core.store_dir, dir.path().join("objects"));
        assert_eq!(config.core.pointer_path, PathBuf::from("/srv/data.dat"));
        assert!(!config.core.decrypt_locally);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = MountConfig::from_args(
            dir.path().join("mnt"),
            Some(dir.path().join("missing.json")),
            None,
            None,
            false,
            true,
            "info".into(),
        );
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[tokio::test]
    async fn test_dispatcher_uses_configured_dirs() {
        let dir = TempDir::new().unwrap();
        let config = MountConfig {
            mount_point: dir.path().join("mnt"),
            core: VdiskConfig::in_dir(&dir.path().join("state")),
            ..MountConfig::default()
        };

        let ops = config.dispatcher().await.unwrap();
        ops.create_directory("/Docs").await.unwrap();
        ops.shutdown().await;

        assert!(dir.path().join("state/data.dat").exists());
        assert!(dir.path().join("state/objects").is_dir());
    }

    #[test]
    fn test_cli_parses_mount() {
        let cli = Cli::try_parse_from([
            "vdisk",
            "mount",
            "/mnt/vdisk",
            "--store-dir",
            "/tmp/objects",
            "--allow-other",
        ])
        .unwrap();
        match cli.command {
            Command::Mount {
                path,
                store_dir,
                allow_other,
                auto_unmount,
                ..
            } => {
                assert_eq!(path, PathBuf::from("/mnt/vdisk"));
                assert_eq!(store_dir, Some(PathBuf::from("/tmp/objects")));
                assert!(allow_other);
                assert!(auto_unmount);
            }
            _ => panic!("expected mount"),
        }
    }
}
