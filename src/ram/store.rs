use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::error::{Result, WeaveError};
use crate::exec::dag::{Node, NodeRef};
use crate::ram::types::Value;
use crate::types::Type;
use crate::utils::raii_mutex_table::RAIIMutexTable;

const OBJECTS_DIR: &str = "objects";
const NAMES_DIR: &str = "names";
const LATEST: &str = "latest";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Reference to a stored value: `<hash>` or `<name>:<hash>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactRef {
    pub name: Option<String>,
    pub version: String,
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}:{}", name, self.version),
            None => write!(f, "{}", self.version),
        }
    }
}

impl FromStr for ArtifactRef {
    type Err = WeaveError;

    fn from_str(s: &str) -> Result<Self> {
        let (name, version) = match s.rsplit_once(':') {
            Some((name, version)) => (Some(name.to_owned()), version),
            None => (None, s),
        };
        if version.is_empty() || name.as_deref() == Some("") {
            return Err(WeaveError::NotFound(format!("malformed artifact ref {:?}", s)));
        }
        Ok(ArtifactRef {
            name,
            version: version.to_owned(),
        })
    }
}

#[derive(Debug)]
struct StoredObject {
    ty: Type,
    value: Value,
}

/// Content addressed value store. Identical encodings share one object;
/// names keep an append-only version list.
pub struct Store {
    dir: Option<PathBuf>,
    objects: RwLock<HashMap<String, Arc<StoredObject>>>,
    names: RwLock<HashMap<String, Vec<String>>>,
    name_locks: RAIIMutexTable<String>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("dir", &self.dir)
            .field("objects", &self.objects.read().len())
            .finish()
    }
}

impl Store {
    pub fn in_memory() -> Self {
        Store {
            dir: None,
            objects: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            name_locks: RAIIMutexTable::new(),
        }
    }

    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(OBJECTS_DIR))?;
        fs::create_dir_all(dir.join(NAMES_DIR))?;
        info!("Opened artifact store at {:?}", dir);
        Ok(Store {
            dir: Some(dir),
            ..Store::in_memory()
        })
    }

    pub fn save(&self, value: &Value, name: Option<&str>) -> Result<ArtifactRef> {
        if let Some(name) = name {
            check_name(name)?;
        }
        let ty = Type::of(value);
        let bytes = encode(&ty, value)?;
        let version = content_hash(&bytes);
        self.put_object(&version, &bytes, ty, value)?;
        if let Some(name) = name {
            self.append_version(name, &version)?;
        }
        let artifact = ArtifactRef {
            name: name.map(str::to_owned),
            version,
        };
        debug!("Saved artifact {}", artifact);
        Ok(artifact)
    }

    pub fn deref(&self, artifact: &ArtifactRef) -> Result<Value> {
        Ok(self.load(artifact)?.value.clone())
    }

    /// Type of the stored value without cloning it.
    pub fn type_of(&self, artifact: &ArtifactRef) -> Result<Type> {
        Ok(self.load(artifact)?.ty.clone())
    }

    /// Parses a ref string, resolving `<name>:latest` to the newest version.
    pub fn resolve_ref(&self, uri: &str) -> Result<ArtifactRef> {
        let artifact = ArtifactRef::from_str(uri)?;
        if artifact.version != LATEST {
            return Ok(artifact);
        }
        let name = artifact.name.unwrap_or_default();
        let version = self
            .versions(&name)?
            .pop()
            .ok_or_else(|| WeaveError::NotFound(format!("no versions of {}", name)))?;
        Ok(ArtifactRef {
            name: Some(name),
            version,
        })
    }

    pub fn versions(&self, name: &str) -> Result<Vec<String>> {
        if let Some(versions) = self.names.read().get(name) {
            return Ok(versions.clone());
        }
        let Some(dir) = &self.dir else {
            return Ok(vec![]);
        };
        let versions = match fs::read_to_string(dir.join(NAMES_DIR).join(name)) {
            Ok(content) => content.lines().map(str::to_owned).collect::<Vec<_>>(),
            Err(e) if e.kind() == ErrorKind::NotFound => vec![],
            Err(e) => return Err(e.into()),
        };
        self.names
            .write()
            .entry(name.to_owned())
            .or_insert_with(|| versions.clone());
        Ok(versions)
    }

    /// A lazy node that loads `uri` when resolved.
    pub fn get(&self, uri: &str) -> NodeRef {
        let ty = self
            .resolve_ref(uri)
            .and_then(|r| self.type_of(&r))
            .unwrap_or(Type::Any);
        Node::output(
            "get",
            vec![("uri".to_owned(), Node::constant(Value::from(uri)))],
            ty,
        )
    }

    fn load(&self, artifact: &ArtifactRef) -> Result<Arc<StoredObject>> {
        if let Some(object) = self.objects.read().get(&artifact.version) {
            return Ok(object.clone());
        }
        let Some(dir) = &self.dir else {
            return Err(WeaveError::NotFound(artifact.to_string()));
        };
        if !is_hash(&artifact.version) {
            return Err(WeaveError::NotFound(artifact.to_string()));
        }
        let bytes = match fs::read(dir.join(OBJECTS_DIR).join(&artifact.version)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(WeaveError::NotFound(artifact.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let (ty, value) = decode(&bytes)?;
        let object = Arc::new(StoredObject { ty, value });
        self.objects
            .write()
            .entry(artifact.version.clone())
            .or_insert_with(|| object.clone());
        Ok(object)
    }

    fn put_object(&self, version: &str, bytes: &[u8], ty: Type, value: &Value) -> Result<()> {
        if self.objects.read().contains_key(version) {
            return Ok(());
        }
        if let Some(dir) = &self.dir {
            let path = dir.join(OBJECTS_DIR).join(version);
            if !path.exists() {
                // Racing writers of the same content each rename a complete
                // file into place; whichever lands last is byte-identical.
                let tmp = dir.join(OBJECTS_DIR).join(format!(
                    ".{}.{}.{}.tmp",
                    version,
                    std::process::id(),
                    TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
                ));
                fs::write(&tmp, bytes)?;
                fs::rename(&tmp, &path)?;
            }
        }
        self.objects
            .write()
            .entry(version.to_owned())
            .or_insert_with(|| {
                Arc::new(StoredObject {
                    ty,
                    value: value.clone(),
                })
            });
        Ok(())
    }

    fn append_version(&self, name: &str, version: &str) -> Result<()> {
        let _guard = self.name_locks.lock(name.to_owned());
        let mut versions = self.versions(name)?;
        if versions.last().map(String::as_str) == Some(version) {
            return Ok(());
        }
        if let Some(dir) = &self.dir {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(NAMES_DIR).join(name))?;
            writeln!(file, "{}", version)?;
        }
        versions.push(version.to_owned());
        self.names.write().insert(name.to_owned(), versions);
        Ok(())
    }
}

fn check_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != LATEST
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(WeaveError::Type(format!("invalid artifact name {:?}", name)))
    }
}

fn is_hash(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn encode(ty: &Type, value: &Value) -> Result<Vec<u8>> {
    let ty = serde_json::to_string(ty)?;
    Ok(bincode::serialize(&(ty, value))?)
}

fn decode(bytes: &[u8]) -> Result<(Type, Value)> {
    let (ty, value): (String, Value) = bincode::deserialize(bytes)?;
    Ok((serde_json::from_str(&ty)?, value))
}

fn content_hash(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
