//! Page containers.
//!
//! A container is a file of fixed-size pages, named `<name>.dat`. The
//! manager keeps a small catalog file (`containers.map`) mapping
//! container ids to names so containers can be re-opened by id alone
//! during restart recovery.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use larch_common::{PageId, PageNumber};

use crate::error::{StorageError, StorageResult};
use crate::page::Page;

const CATALOG_FILE: &str = "containers.map";

/// One open container file.
struct Container {
    file: Mutex<File>,
}

/// Creates, opens, and performs page I/O on containers.
pub struct ContainerManager {
    base_path: PathBuf,
    page_size: usize,
    containers: RwLock<HashMap<u32, Container>>,
    catalog: Mutex<HashMap<u32, String>>,
}

impl ContainerManager {
    /// Opens the manager rooted at `base_path`, re-opening every
    /// container recorded in the catalog.
    pub fn open(base_path: impl AsRef<Path>, page_size: usize) -> StorageResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        let mut catalog = HashMap::new();
        let catalog_path = base_path.join(CATALOG_FILE);
        if catalog_path.exists() {
            let mut text = String::new();
            File::open(&catalog_path)?.read_to_string(&mut text)?;
            for line in text.lines() {
                let mut parts = line.splitn(2, ' ');
                if let (Some(id), Some(name)) = (parts.next(), parts.next()) {
                    if let Ok(id) = id.parse::<u32>() {
                        catalog.insert(id, name.to_string());
                    }
                }
            }
        }

        let manager = Self {
            base_path,
            page_size,
            containers: RwLock::new(HashMap::new()),
            catalog: Mutex::new(catalog),
        };
        let ids: Vec<u32> = manager.catalog.lock().keys().copied().collect();
        for id in ids {
            manager.open_container(id)?;
        }
        Ok(manager)
    }

    /// The configured page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Creates and registers a new container.
    pub fn create_container(&self, container_id: u32, name: &str) -> StorageResult<()> {
        {
            let catalog = self.catalog.lock();
            if catalog.contains_key(&container_id) {
                return Err(StorageError::ContainerExists { container_id });
            }
        }
        let path = self.container_path(name);
        debug!(container_id, ?path, "creating container");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        {
            let mut catalog = self.catalog.lock();
            catalog.insert(container_id, name.to_string());
            self.rewrite_catalog(&catalog)?;
        }
        self.containers.write().insert(
            container_id,
            Container {
                file: Mutex::new(file),
            },
        );
        Ok(())
    }

    /// Returns true if the container exists.
    pub fn exists(&self, container_id: u32) -> bool {
        self.containers.read().contains_key(&container_id)
    }

    fn open_container(&self, container_id: u32) -> StorageResult<()> {
        let name = self
            .catalog
            .lock()
            .get(&container_id)
            .cloned()
            .ok_or(StorageError::UnknownContainer { container_id })?;
        let path = self.container_path(&name);
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        self.containers.write().insert(
            container_id,
            Container {
                file: Mutex::new(file),
            },
        );
        Ok(())
    }

    /// Reads a page image. Pages past the end of the file read as
    /// zero-filled, which parses as a fresh, never-written page.
    pub fn read_page(&self, page_id: PageId) -> StorageResult<Page> {
        let containers = self.containers.read();
        let container = containers
            .get(&page_id.container_id())
            .ok_or(StorageError::UnknownContainer {
                container_id: page_id.container_id(),
            })?;

        let mut data = vec![0u8; self.page_size];
        let offset = self.page_offset(page_id.page_number());
        let mut file = container.file.lock();
        let len = file.metadata()?.len();
        if offset < len {
            file.seek(SeekFrom::Start(offset))?;
            let available = ((len - offset) as usize).min(self.page_size);
            file.read_exact(&mut data[..available])?;
        }
        Ok(Page::from_bytes(data))
    }

    /// Writes a page image and syncs it to disk.
    pub fn write_page(&self, page_id: PageId, page: &Page) -> StorageResult<()> {
        let containers = self.containers.read();
        let container = containers
            .get(&page_id.container_id())
            .ok_or(StorageError::UnknownContainer {
                container_id: page_id.container_id(),
            })?;

        let offset = self.page_offset(page_id.page_number());
        let mut file = container.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(page.bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn page_offset(&self, page_number: PageNumber) -> u64 {
        u64::from(page_number.as_u32()) * self.page_size as u64
    }

    fn container_path(&self, name: &str) -> PathBuf {
        self.base_path.join(format!("{}.dat", name))
    }

    fn rewrite_catalog(&self, catalog: &HashMap<u32, String>) -> StorageResult<()> {
        let mut entries: Vec<_> = catalog.iter().collect();
        entries.sort_by_key(|(id, _)| **id);
        let mut text = String::new();
        for (id, name) in entries {
            text.push_str(&format!("{} {}\n", id, name));
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.base_path.join(CATALOG_FILE))?;
        file.write_all(text.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }
}
