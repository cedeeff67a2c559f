use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{AmError, AmResult};

/// Name of the staged backing-service configuration file inside the
/// generated configuration directory.
pub const SITE_FILE_NAME: &str = "backing-site.xml";

pub const KEY_ROOT_DIR: &str = "regiondb.rootdir";
pub const KEY_ZK_QUORUM: &str = "regiondb.zookeeper.quorum";
pub const KEY_ZK_PORT: &str = "regiondb.zookeeper.client.port";
pub const KEY_ZK_PATH: &str = "regiondb.znode.parent";

const DEFAULT_ZK_HOSTS: &str = "localhost";
const DEFAULT_ZK_PATH: &str = "/regiondb";

/// The backing-service site configuration, read once at boot and
/// immutable afterwards.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    /// All properties, in file order.
    pub properties: IndexMap<String, String>,
    pub root_path: String,
    pub zk_hosts: String,
    pub zk_port: u16,
    pub zk_path: String,
}

impl SiteConfig {
    /// Loads `<conf_dir>/backing-site.xml`. A missing directory or file,
    /// a malformed document, or an unusable ZooKeeper port are all
    /// configuration failures the application master must not survive.
    pub fn load(conf_dir: &Path) -> AmResult<Self> {
        if !conf_dir.is_dir() {
            return Err(AmError::BadConfig(format!(
                "generated configuration directory {} does not exist",
                conf_dir.display()
            )));
        }
        let path = conf_dir.join(SITE_FILE_NAME);
        let text = fs::read_to_string(&path).map_err(|e| {
            AmError::BadConfig(format!("cannot read site file {}: {e}", path.display()))
        })?;
        let properties = parse_site_document(&text)?;
        Self::try_new(properties)
    }

    fn try_new(properties: IndexMap<String, String>) -> AmResult<Self> {
        let zk_port = properties
            .get(KEY_ZK_PORT)
            .map(|v| {
                v.parse::<u16>().map_err(|_| {
                    AmError::BadConfig(format!("invalid ZooKeeper port {v:?} in {KEY_ZK_PORT}"))
                })
            })
            .transpose()?
            .unwrap_or(0);
        if zk_port == 0 {
            return Err(AmError::BadConfig(format!(
                "the site configuration does not define a usable ZooKeeper port in {KEY_ZK_PORT}"
            )));
        }
        let root_path = properties.get(KEY_ROOT_DIR).cloned().unwrap_or_default();
        let zk_hosts = properties
            .get(KEY_ZK_QUORUM)
            .cloned()
            .unwrap_or_else(|| DEFAULT_ZK_HOSTS.to_string());
        let zk_path = properties
            .get(KEY_ZK_PATH)
            .cloned()
            .unwrap_or_else(|| DEFAULT_ZK_PATH.to_string());
        Ok(Self {
            properties,
            root_path,
            zk_hosts,
            zk_port,
            zk_path,
        })
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    Name,
    Value,
}

/// Parses a Hadoop-style site document:
/// `<configuration><property><name>..</name><value>..</value></property>...`.
fn parse_site_document(text: &str) -> AmResult<IndexMap<String, String>> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut properties = IndexMap::new();
    let mut field: Option<Field> = None;
    let mut name = String::new();
    let mut value = String::new();
    loop {
        let event = reader
            .read_event()
            .map_err(|e| AmError::BadConfig(format!("malformed site file: {e}")))?;
        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"property" => {
                    name.clear();
                    value.clear();
                }
                b"name" => field = Some(Field::Name),
                b"value" => field = Some(Field::Value),
                _ => {}
            },
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| AmError::BadConfig(format!("malformed site file: {e}")))?;
                match field {
                    Some(Field::Name) => name.push_str(&text),
                    Some(Field::Value) => value.push_str(&text),
                    None => {}
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"property" => {
                    if !name.is_empty() {
                        properties.insert(name.clone(), value.clone());
                    }
                }
                b"name" | b"value" => field = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(properties)
}
