use std::path::Path;

use clap::Parser;
use fuser::MountOption;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vdisk_fuse::VdiskFs;
use vdisk_fuse::config::{Cli, Command, MountConfig};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Mount {
            path,
            config,
            store_dir,
            pointer,
            allow_other,
            auto_unmount,
            log_level,
        } => {
            let config = MountConfig::from_args(
                path,
                config,
                store_dir,
                pointer,
                allow_other,
                auto_unmount,
                log_level,
            )?;

            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
                )
                .init();

            mount(config)?;
        }

        Command::Unmount { path } => {
            unmount(&path)?;
            println!("Unmounted {}", path.display());
        }

        Command::Status { path } => {
            if path.exists() {
                if is_mounted(&path)? {
                    println!("Status: MOUNTED at {}", path.display());
                } else {
                    println!("Status: NOT MOUNTED (path exists but is not a mount point)");
                }
            } else {
                println!("Status: NOT MOUNTED (path does not exist)");
            }
        }
    }

    Ok(())
}

fn mount(config: MountConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.mount_point)?;

    // The FUSE session runs on this thread and blocks on the runtime's workers.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("vdisk-worker")
        .build()?;
    let ops = runtime.block_on(config.dispatcher())?;

    info!(
        store = %config.core.store_dir.display(),
        pointer = %config.core.pointer_path.display(),
        decrypt_locally = config.core.decrypt_locally,
        "Store opened"
    );

    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    let fs = VdiskFs::new(ops, runtime.handle().clone(), uid, gid);

    let mut options = vec![MountOption::FSName("vdisk".into()), MountOption::AllowRoot];
    if config.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }

    println!("Mounted at {}", config.mount_point.display());
    fuser::mount2(fs, &config.mount_point, &options)?;
    println!("Unmounted");
    Ok(())
}

#[cfg(target_os = "macos")]
fn unmount(path: &Path) -> anyhow::Result<()> {
    let output = std::process::Command::new("umount").arg(path).output()?;
    if !output.status.success() {
        anyhow::bail!("umount failed: {}", String::from_utf8_lossy(&output.stderr));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn unmount(path: &Path) -> anyhow::Result<()> {
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(path)
        .output()?;
    if !output.status.success() {
        anyhow::bail!(
            "fusermount -u failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn unmount(_path: &Path) -> anyhow::Result<()> {
    anyhow::bail!("Unmount not supported on this platform")
}

fn is_mounted(path: &Path) -> anyhow::Result<bool> {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let target = canonical.display().to_string();

    #[cfg(target_os = "linux")]
    {
        let mounts = std::fs::read_to_string("/proc/mounts")?;
        Ok(mounts
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|mount_point| mount_point == target))
    }

    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("mount").output()?;
        Ok(String::from_utf8_lossy(&output.stdout).contains(&format!(" on {target} ")))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = target;
        Ok(false)
    }
}
