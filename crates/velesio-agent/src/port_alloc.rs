use std::collections::BTreeMap;

const DEFAULT_PAIRS: [(u16, u16); 5] = [
    (1337, 1338),
    (1339, 1340),
    (1341, 1342),
    (1343, 1344),
    (1345, 1346),
];

/// Fixed pairing of caller-facing ports with the ports workers bind.
///
/// The reverse proxy listens on the external side; both directions are
/// one-to-one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    to_internal: BTreeMap<u16, u16>,
    to_external: BTreeMap<u16, u16>,
}

impl Default for PortMapping {
    fn default() -> Self {
        // The built-in pairs are known to be unique.
        let mut to_internal = BTreeMap::new();
        let mut to_external = BTreeMap::new();
        for (ext, int) in DEFAULT_PAIRS {
            to_internal.insert(ext, int);
            to_external.insert(int, ext);
        }
        Self {
            to_internal,
            to_external,
        }
    }
}

impl PortMapping {
    pub fn new(pairs: impl IntoIterator<Item = (u16, u16)>) -> anyhow::Result<Self> {
        let mut to_internal = BTreeMap::new();
        let mut to_external = BTreeMap::new();
        for (ext, int) in pairs {
            if ext == 0 || int == 0 {
                anyhow::bail!("port 0 is not a valid slot ({ext}:{int})");
            }
            if to_internal.insert(ext, int).is_some() {
                anyhow::bail!("external port mapped twice: {ext}");
            }
            if to_external.insert(int, ext).is_some() {
                anyhow::bail!("internal port mapped twice: {int}");
            }
        }
        if to_internal.is_empty() {
            anyhow::bail!("port mapping is empty");
        }
        Ok(Self {
            to_internal,
            to_external,
        })
    }

    /// Parses `ext:int` pairs separated by commas, e.g. `1337:1338,1339:1340`.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut pairs = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (ext, int) = part
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("expected ext:int, got {part:?}"))?;
            let ext: u16 = ext
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid external port in {part:?}"))?;
            let int: u16 = int
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid internal port in {part:?}"))?;
            pairs.push((ext, int));
        }
        Self::new(pairs)
    }

    pub fn internal_of(&self, external_port: u16) -> Option<u16> {
        self.to_internal.get(&external_port).copied()
    }

    pub fn external_of(&self, internal_port: u16) -> Option<u16> {
        self.to_external.get(&internal_port).copied()
    }

    pub fn external_ports(&self) -> Vec<u16> {
        self.to_internal.keys().copied().collect()
    }
}
