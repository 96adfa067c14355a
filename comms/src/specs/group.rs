use std::{env, io, time::Duration};

use serde::{Deserialize, Serialize};

/// Collective calls give up after this long unless configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_BACKEND: &str = "tcp";

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

/// Parameters every member passes to join a collective group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub backend: String,
    pub addr: String,
    pub world_size: usize,
    pub rank: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// What a member announces to the sender rank when joining.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub rank: usize,
    pub world_size: usize,
    pub backend: String,
}

impl From<&GroupSpec> for JoinRequest {
    fn from(spec: &GroupSpec) -> Self {
        Self {
            rank: spec.rank,
            world_size: spec.world_size,
            backend: spec.backend.clone(),
        }
    }
}

impl GroupSpec {
    pub fn new(addr: impl Into<String>, world_size: usize, rank: usize) -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            addr: addr.into(),
            world_size,
            rank,
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Reads the spec from `{prefix}_ADDR`, `{prefix}_WORLD_SIZE`, `{prefix}_RANK`,
    /// and the optional `{prefix}_BACKEND` and `{prefix}_TIMEOUT_MS`.
    pub fn from_env(prefix: &str) -> io::Result<Self> {
        let var = |name: &str| env::var(format!("{prefix}_{name}"));
        let required = |name: &str| {
            var(name).map_err(|e| io::Error::new(io::ErrorKind::NotFound, format!("{prefix}_{name}: {e}")))
        };
        let number = |name: &str, raw: String| {
            raw.parse::<u64>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{prefix}_{name}: {e}")))
        };

        let mut spec = Self::new(
            required("ADDR")?,
            number("WORLD_SIZE", required("WORLD_SIZE")?)? as usize,
            number("RANK", required("RANK")?)? as usize,
        );

        if let Ok(backend) = var("BACKEND") {
            spec.backend = backend;
        }

        if let Ok(raw) = var("TIMEOUT_MS") {
            spec.timeout_ms = number("TIMEOUT_MS", raw)?;
        }

        Ok(spec)
    }

    /// Checks the spec is usable on its own.
    pub fn validate(&self) -> Result<(), String> {
        if self.world_size == 0 {
            return Err("world size must be at least 1".into());
        }

        if self.rank >= self.world_size {
            return Err(format!(
                "rank {} is outside of a group of {}",
                self.rank, self.world_size
            ));
        }

        Ok(())
    }

    /// Checks a joining member agrees with this spec.
    ///
    /// # Arguments
    /// * `request` - What the joining member announced.
    /// * `taken` - Whether the requested rank already joined.
    pub fn accepts(&self, request: &JoinRequest, taken: bool) -> Result<(), String> {
        if request.backend != self.backend {
            return Err(format!(
                "backend {} does not match the group backend {}",
                request.backend, self.backend
            ));
        }

        if request.world_size != self.world_size {
            return Err(format!(
                "world size {} does not match the group world size {}",
                request.world_size, self.world_size
            ));
        }

        if request.rank == 0 || request.rank >= self.world_size {
            return Err(format!(
                "rank {} is not a valid peer rank in 1..{}",
                request.rank, self.world_size
            ));
        }

        if taken {
            return Err(format!("rank {} already joined", request.rank));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_only_matching_members() {
        let spec = GroupSpec::new("127.0.0.1:0", 3, 0);
        let ok = JoinRequest {
            rank: 2,
            world_size: 3,
            backend: DEFAULT_BACKEND.into(),
        };

        assert!(spec.accepts(&ok, false).is_ok());
        assert!(spec.accepts(&ok, true).is_err());

        let wrong_size = JoinRequest {
            world_size: 4,
            ..ok.clone()
        };
        assert!(spec.accepts(&wrong_size, false).is_err());

        let wrong_backend = JoinRequest {
            backend: "nccl".into(),
            ..ok.clone()
        };
        assert!(spec.accepts(&wrong_backend, false).is_err());

        let root = JoinRequest { rank: 0, ..ok };
        assert!(spec.accepts(&root, false).is_err());
    }

    #[test]
    fn timeout_defaults_to_two_hours() {
        let spec: GroupSpec = serde_json::from_str(
            r#"{"backend":"tcp","addr":"h:1","world_size":2,"rank":1}"#,
        )
        .unwrap();

        assert_eq!(spec.timeout(), Duration::from_secs(7200));
        assert!(spec.validate().is_ok());
        assert!(GroupSpec::new("h:1", 2, 2).validate().is_err());
    }
}
