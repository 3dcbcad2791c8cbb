//! The container registry and lifecycle driver.
//!
//! Owns the in-memory map of live containers, generates container IDs,
//! serializes create/destroy against the machine runtime, and answers
//! lookup/filter/list queries. The registry is authoritative for the API
//! surface; it is not reconciled with the machine runtime on startup.

use crate::container::{BindMount, BindMountMode, Container, ContainerSpec, Properties};
use crate::error::{Error, Result};
use crate::machine::Machine;
use crate::rootfs::RootFs;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Unit template linked from the skeleton directory.
const UNIT_TEMPLATE: &str = "garden-container@.service";

/// How often and how long to poll the machine runtime for "up" after start.
const UP_POLL_ATTEMPTS: u32 = 10;
const UP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Retries for image removal; nspawn can hold the image briefly after the
/// unit stops.
const IMAGE_REMOVE_ATTEMPTS: u32 = 10;
const IMAGE_REMOVE_INTERVAL: Duration = Duration::from_secs(1);

/// Lowercase base-32 alphabet for container IDs.
const CONTAINER_ID_ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// The backend: registry plus create/destroy orchestration.
pub struct Backend {
    containers_dir: PathBuf,
    skeleton_dir: PathBuf,

    containers: RwLock<HashMap<String, Arc<Container>>>,

    /// 55-bit counter behind the base-32 IDs. Seeded from wall-clock
    /// nanoseconds so IDs stay unique across restarts; incremented without
    /// the registry lock so ID generation never waits on a slow Create.
    container_num: AtomicU64,

    machine: Machine,
}

impl Backend {
    /// Create a backend rooted at `containers_dir`, sourcing binaries and
    /// the unit template from `skeleton_dir`.
    pub fn new(containers_dir: impl Into<PathBuf>, skeleton_dir: impl Into<PathBuf>) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;

        Self {
            containers_dir: containers_dir.into(),
            skeleton_dir: skeleton_dir.into(),
            containers: RwLock::new(HashMap::new()),
            container_num: AtomicU64::new(seed),
            machine: Machine::new(),
        }
    }

    /// Prepare the host: ensure the containers directory exists and link
    /// the parameterized unit template into systemd's search path.
    pub fn start(&self) -> Result<()> {
        fs::create_dir_all(&self.containers_dir)?;
        self.machine
            .link_unit(&self.skeleton_dir.join(UNIT_TEMPLATE))
    }

    /// Destroy every known container, best-effort.
    pub fn stop(&self) {
        let handles: Vec<String> = self.containers.read().keys().cloned().collect();
        for handle in handles {
            if let Err(e) = self.destroy(&handle) {
                warn!(handle = %handle, error = %e, "destroy failed during stop");
            }
        }
    }

    /// Create a container and register it under its handle.
    ///
    /// Atomic from the registry's perspective: on any failure the partially
    /// created resources are torn down and the registry is left untouched.
    pub fn create(&self, mut spec: ContainerSpec) -> Result<Arc<Container>> {
        let rootfs = RootFs::parse(&spec.rootfs)?;

        let id = self.generate_container_id();
        if spec.handle.is_empty() {
            spec.handle = id.clone();
        }
        let handle = spec.handle.clone();

        let dir = self.containers_dir.join(format!("container-{}", id));
        let mut teardown = Teardown::new(&self.machine);

        fs::create_dir_all(&dir)?;
        teardown.dir = Some(dir.clone());

        for (subdir, mode) in [("run", 0o755), ("bin", 0o755), ("tmp", 0o777)] {
            let path = dir.join(subdir);
            fs::create_dir_all(&path)?;
            fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
        }

        for binary in ["wshd", "wsh"] {
            fs::copy(
                self.skeleton_dir.join("bin").join(binary),
                dir.join("bin").join(binary),
            )?;
        }

        let (rootfs_dir, image) = match &rootfs {
            RootFs::Raw { path } => {
                if !path.is_dir() {
                    return Err(Error::invalid_rootfs(format!(
                        "rootfs path does not exist: {}",
                        path.display()
                    )));
                }
                (path.clone(), None)
            }
            RootFs::Docker { index, repo, tag } => {
                let base = rootfs
                    .image_name()
                    .expect("docker rootfs always has an image name");
                self.machine.pull_docker(index, repo, tag, &base)?;

                let clone = format!("container-{}", id);
                self.machine.clone_image(&base, &clone)?;
                teardown.image = Some(clone.clone());

                (self.machine.image_path(&clone), Some(clone))
            }
        };

        prepare_rootfs(&rootfs_dir)?;
        write_boot_script(&dir, &id, &rootfs_dir, &spec.bind_mounts)?;

        let unit = format!("garden-container@{}", id);
        self.machine.start_unit(&unit)?;
        teardown.unit = Some(unit);

        let mut up = false;
        for _ in 0..UP_POLL_ATTEMPTS {
            if self.machine.status(&id).is_ok() {
                up = true;
                break;
            }
            std::thread::sleep(UP_POLL_INTERVAL);
        }
        if !up {
            return Err(Error::runtime(
                format!("machinectl status {}", id),
                "container did not come up",
            ));
        }

        let container = Arc::new(Container::new(
            spec,
            dir,
            id.clone(),
            image,
            self.machine.clone(),
        ));

        self.containers.write().insert(handle, Arc::clone(&container));
        teardown.disarm();

        info!(container = %id, handle = %container.handle(), "container created");
        Ok(container)
    }

    /// Destroy a container: stop its unit, drop its image clone, delete its
    /// working directory, and purge the registry entry.
    pub fn destroy(&self, handle: &str) -> Result<()> {
        let container = self.lookup(handle)?;

        self.machine
            .stop_unit(&format!("garden-container@{}", container.id()))?;

        if let Some(image) = container.image() {
            let mut removed = Ok(());
            for attempt in 0..IMAGE_REMOVE_ATTEMPTS {
                removed = self.machine.remove_image(image);
                if removed.is_ok() {
                    break;
                }
                if attempt + 1 < IMAGE_REMOVE_ATTEMPTS {
                    std::thread::sleep(IMAGE_REMOVE_INTERVAL);
                }
            }
            removed?;
        }

        fs::remove_dir_all(container.dir())?;
        self.containers.write().remove(handle);

        info!(container = %container.id(), handle = %handle, "container destroyed");
        Ok(())
    }

    /// All containers whose property map is a superset of `filter`.
    pub fn containers(&self, filter: &Properties) -> Vec<Arc<Container>> {
        self.containers
            .read()
            .values()
            .filter(|container| container.matches(filter))
            .cloned()
            .collect()
    }

    /// The container registered under `handle`.
    pub fn lookup(&self, handle: &str) -> Result<Arc<Container>> {
        self.containers
            .read()
            .get(handle)
            .cloned()
            .ok_or_else(|| Error::container_not_found(handle))
    }

    /// The grace-time hint of a container, for observation by an
    /// orchestration layer above.
    pub fn grace_time(&self, container: &Container) -> Duration {
        container.grace_time()
    }

    /// Render the next counter value as 11 base-32 digits, most significant
    /// first.
    fn generate_container_id(&self) -> String {
        let num = self
            .container_num
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_add(1);

        let mut id = String::with_capacity(11);
        for i in 0..11u64 {
            let shift = 55 - (i + 1) * 5;
            let digit = ((num >> shift) & 31) as usize;
            id.push(CONTAINER_ID_ALPHABET[digit] as char);
        }
        id
    }
}

/// RAII cleanup for half-created containers.
///
/// Disarmed once the registry entry exists; until then, dropping it stops
/// the unit, removes the image clone, and deletes the working directory,
/// best-effort and in that order.
struct Teardown<'a> {
    machine: &'a Machine,
    dir: Option<PathBuf>,
    unit: Option<String>,
    image: Option<String>,
    armed: bool,
}

impl<'a> Teardown<'a> {
    fn new(machine: &'a Machine) -> Self {
        Self {
            machine,
            dir: None,
            unit: None,
            image: None,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        if let Some(unit) = &self.unit {
            if let Err(e) = self.machine.stop_unit(unit) {
                warn!(unit = %unit, error = %e, "failed to stop unit during rollback");
            }
        }
        if let Some(image) = &self.image {
            if let Err(e) = self.machine.remove_image(image) {
                warn!(image = %image, error = %e, "failed to remove image during rollback");
            }
        }
        if let Some(dir) = &self.dir {
            if let Err(e) = fs::remove_dir_all(dir) {
                warn!(dir = %dir.display(), error = %e, "failed to remove dir during rollback");
            }
        }
    }
}

/// Make a rootfs acceptable to nspawn: drop any stale `etc/resolv.conf` and
/// plant an empty `sbin/wshd` so the entry-binary validation passes before
/// the bind mount shadows it.
fn prepare_rootfs(rootfs: &Path) -> Result<()> {
    match fs::remove_file(rootfs.join("etc/resolv.conf")) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let sbin = rootfs.join("sbin");
    fs::create_dir_all(&sbin)?;
    let placeholder = sbin.join("wshd");
    if !placeholder.exists() {
        fs::File::create(&placeholder)?;
    }

    Ok(())
}

/// Write the nspawn boot script the parameterized unit executes.
fn write_boot_script(
    dir: &Path,
    id: &str,
    rootfs_dir: &Path,
    bind_mounts: &[BindMount],
) -> Result<()> {
    let mut mount_flags = String::new();
    for mount in bind_mounts {
        let flag = match mount.mode {
            BindMountMode::Ro => "--bind-ro",
            BindMountMode::Rw => "--bind",
        };
        mount_flags.push_str(&format!(
            "\t{} {}:{} \\\n",
            flag,
            mount.src_path.display(),
            mount.dst_path.display()
        ));
    }

    let script = format!(
        "#!/bin/sh\n\n\
         exec /usr/bin/systemd-nspawn \\\n\
         \t--capability all \\\n\
         \t--machine {id} \\\n\
         \t--directory '{rootfs}' \\\n\
         \t--ephemeral \\\n\
         \t--quiet \\\n\
         \t--keep-unit \\\n\
         \t--bind {dir}/tmp:/tmp \\\n\
         \t--bind {dir}/run:/tmp/garden-init \\\n\
         \t--bind {dir}/bin/wshd:/sbin/wshd \\\n\
         {mounts}\
         \t-- /sbin/wshd --run /tmp/garden-init\n",
        id = id,
        rootfs = rootfs_dir.display(),
        dir = dir.display(),
        mounts = mount_flags,
    );

    let path = dir.join("start");
    fs::write(&path, script)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_backend() -> (Backend, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let containers_dir = root.path().join("containers");
        let skeleton_dir = root.path().join("skeleton");
        fs::create_dir_all(skeleton_dir.join("bin")).unwrap();
        fs::write(skeleton_dir.join("bin/wshd"), b"#!stub").unwrap();
        fs::write(skeleton_dir.join("bin/wsh"), b"#!stub").unwrap();
        fs::create_dir_all(&containers_dir).unwrap();

        (Backend::new(containers_dir, skeleton_dir), root)
    }

    fn register(backend: &Backend, handle: &str) -> Arc<Container> {
        let container = Arc::new(Container::new(
            ContainerSpec {
                handle: handle.to_string(),
                ..Default::default()
            },
            backend.containers_dir.join(format!("container-{}", handle)),
            handle.to_string(),
            None,
            Machine::new(),
        ));
        backend
            .containers
            .write()
            .insert(handle.to_string(), Arc::clone(&container));
        container
    }

    #[test]
    fn test_generated_ids_are_11_base32_chars() {
        let (backend, _root) = test_backend();

        for _ in 0..100 {
            let id = backend.generate_container_id();
            assert_eq!(id.len(), 11, "id: {}", id);
            assert!(
                id.bytes().all(|b| CONTAINER_ID_ALPHABET.contains(&b)),
                "id outside alphabet: {}",
                id
            );
        }
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let (backend, _root) = test_backend();
        let first = backend.generate_container_id();
        let second = backend.generate_container_id();
        assert_ne!(first, second);
    }

    #[test]
    fn test_id_encoding_extracts_five_bit_groups() {
        let (backend, _root) = test_backend();

        // Pin the counter so the next id is a known value: the increment
        // makes it 1, which renders as ten zeros and a trailing "1".
        backend.container_num.store(0, Ordering::SeqCst);
        assert_eq!(backend.generate_container_id(), "00000000001");

        // 32 = 1 << 5 lands in the second-to-last digit.
        backend.container_num.store(31, Ordering::SeqCst);
        assert_eq!(backend.generate_container_id(), "00000000010");
    }

    #[test]
    fn test_lookup_unknown_handle() {
        let (backend, _root) = test_backend();
        let err = backend.lookup("missing").unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_destroy_unknown_handle_is_not_found() {
        let (backend, _root) = test_backend();
        let err = backend.destroy("missing").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_containers_filters_by_property_superset() {
        let (backend, _root) = test_backend();

        let web = register(&backend, "web-1");
        web.set_property("role", "web");
        web.set_property("env", "prod");

        let db = register(&backend, "db-1");
        db.set_property("role", "db");

        let all = backend.containers(&Properties::new());
        assert_eq!(all.len(), 2);

        let mut filter = Properties::new();
        filter.insert("role".to_string(), "web".to_string());
        let matched = backend.containers(&filter);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].handle(), "web-1");

        filter.insert("env".to_string(), "staging".to_string());
        assert!(backend.containers(&filter).is_empty());
    }

    #[test]
    fn test_create_with_missing_raw_rootfs_leaves_no_residue() {
        let (backend, _root) = test_backend();

        let err = backend
            .create(ContainerSpec {
                rootfs: "raw:///garden-test/does-not-exist".to_string(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRootfs(_)), "got: {}", err);

        // Registry untouched and the working directory rolled back.
        assert!(backend.containers(&Properties::new()).is_empty());
        let leftovers: Vec<_> = fs::read_dir(&backend.containers_dir)
            .unwrap()
            .collect();
        assert!(leftovers.is_empty(), "leftover dirs: {:?}", leftovers);
    }

    #[test]
    fn test_create_with_invalid_uri_fails_fast() {
        let (backend, _root) = test_backend();
        assert!(backend
            .create(ContainerSpec {
                rootfs: String::new(),
                ..Default::default()
            })
            .is_err());
        assert!(backend
            .create(ContainerSpec {
                rootfs: "ftp://nope".to_string(),
                ..Default::default()
            })
            .is_err());
    }

    #[test]
    fn test_boot_script_contents() {
        let dir = tempfile::tempdir().unwrap();

        write_boot_script(
            dir.path(),
            "0123456789a",
            Path::new("/images/base"),
            &[
                BindMount {
                    src_path: PathBuf::from("/host/cache"),
                    dst_path: PathBuf::from("/var/cache"),
                    mode: BindMountMode::Rw,
                },
                BindMount {
                    src_path: PathBuf::from("/host/certs"),
                    dst_path: PathBuf::from("/etc/certs"),
                    mode: BindMountMode::Ro,
                },
            ],
        )
        .unwrap();

        let script = fs::read_to_string(dir.path().join("start")).unwrap();
        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains("--machine 0123456789a"));
        assert!(script.contains("--directory '/images/base'"));
        assert!(script.contains("--ephemeral"));
        assert!(script.contains("--keep-unit"));
        assert!(script.contains("run:/tmp/garden-init"));
        assert!(script.contains("--bind /host/cache:/var/cache"));
        assert!(script.contains("--bind-ro /host/certs:/etc/certs"));
        assert!(script.contains("/sbin/wshd --run /tmp/garden-init"));

        let mode = fs::metadata(dir.path().join("start"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_prepare_rootfs_plants_placeholder_and_clears_resolv_conf() {
        let rootfs = tempfile::tempdir().unwrap();
        fs::create_dir_all(rootfs.path().join("etc")).unwrap();
        fs::write(rootfs.path().join("etc/resolv.conf"), b"nameserver 1.1.1.1").unwrap();

        prepare_rootfs(rootfs.path()).unwrap();

        assert!(!rootfs.path().join("etc/resolv.conf").exists());
        assert!(rootfs.path().join("sbin/wshd").exists());

        // Idempotent.
        prepare_rootfs(rootfs.path()).unwrap();
    }
}
