use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{Error, IoResultExt, Result};

/// name of the repository metadata directory
pub const WALGIT_DIR: &str = ".walgit";

/// a walgit repository: a working directory plus its `.walgit` store
pub struct Repo {
    work_dir: PathBuf,
    config: Config,
}

impl Repo {
    /// initialize a new repository under the given working directory
    pub fn init(work_dir: &Path, name: &str) -> Result<Self> {
        let walgit = work_dir.join(WALGIT_DIR);
        if walgit.join("config.toml").exists() {
            return Err(Error::RepoExists(work_dir.to_path_buf()));
        }

        // create directory structure
        fs::create_dir_all(walgit.join("objects")).with_path(&walgit)?;
        fs::create_dir_all(walgit.join("refs/heads")).with_path(&walgit)?;
        fs::create_dir_all(walgit.join("refs/tags")).with_path(&walgit)?;
        fs::create_dir_all(walgit.join("refs/remotes")).with_path(&walgit)?;
        fs::create_dir_all(walgit.join("stash")).with_path(&walgit)?;
        fs::create_dir_all(walgit.join("tmp")).with_path(&walgit)?;

        let config = Config::new(name);
        config.save(&walgit.join("config.toml"))?;

        // HEAD starts symbolic on the default branch
        let head = format!("ref: refs/heads/{}\n", config.repository.default_branch);
        fs::write(walgit.join("HEAD"), head).with_path(&walgit)?;

        Ok(Self {
            work_dir: work_dir.to_path_buf(),
            config,
        })
    }

    /// open an existing repository
    pub fn open(work_dir: &Path) -> Result<Self> {
        let config_path = work_dir.join(WALGIT_DIR).join("config.toml");
        if !config_path.exists() {
            return Err(Error::NoRepo(work_dir.to_path_buf()));
        }

        let config = Config::load(&config_path)?;

        Ok(Self {
            work_dir: work_dir.to_path_buf(),
            config,
        })
    }

    /// walk up from a starting directory to find the enclosing repository
    pub fn discover(start: &Path) -> Result<Self> {
        let mut dir = start;
        loop {
            if dir.join(WALGIT_DIR).join("config.toml").exists() {
                return Self::open(dir);
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => return Err(Error::NoRepo(start.to_path_buf())),
            }
        }
    }

    /// working directory root
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// repository configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// mutable access to configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// save configuration changes
    pub fn save_config(&self) -> Result<()> {
        self.config.save(&self.config_path())
    }

    /// path to the .walgit directory
    pub fn walgit_path(&self) -> PathBuf {
        self.work_dir.join(WALGIT_DIR)
    }

    /// path to config.toml
    pub fn config_path(&self) -> PathBuf {
        self.walgit_path().join("config.toml")
    }

    /// path to the objects directory
    pub fn objects_path(&self) -> PathBuf {
        self.walgit_path().join("objects")
    }

    /// path to the refs directory
    pub fn refs_path(&self) -> PathBuf {
        self.walgit_path().join("refs")
    }

    /// path to the HEAD file
    pub fn head_path(&self) -> PathBuf {
        self.walgit_path().join("HEAD")
    }

    /// path to the stash directory
    pub fn stash_path(&self) -> PathBuf {
        self.walgit_path().join("stash")
    }

    /// path to the tmp directory (for atomic writes)
    pub fn tmp_path(&self) -> PathBuf {
        self.walgit_path().join("tmp")
    }

    /// path to the lock file
    pub fn lock_path(&self) -> PathBuf {
        self.walgit_path().join("repo.lock")
    }

    /// acquire the exclusive repository write lock
    /// returns a guard that releases the lock on drop
    pub fn lock(&self) -> Result<RepoLock> {
        let lock_path = self.lock_path();
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(_) => Ok(RepoLock { path: lock_path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::LockContention)
            }
            Err(e) => Err(Error::Io {
                path: lock_path,
                source: e,
            }),
        }
    }

    /// try to acquire the lock, returning None if already held
    pub fn try_lock(&self) -> Result<Option<RepoLock>> {
        match self.lock() {
            Ok(lock) => Ok(Some(lock)),
            Err(Error::LockContention) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// guard that holds the repository lock until dropped
pub struct RepoLock {
    path: PathBuf,
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
