//! Runtime configuration.
//!
//! Every tunable is resolved in the same order the cluster tooling
//! expects: a `--key=val` command line override wins, then an
//! upper-cased environment variable, then the built-in default.

use std::collections::HashMap;

use anyhow::{bail, Error};

#[derive(Debug, Clone)]
pub struct Config {
    pub bucket_name: String,
    pub aws_s3_gateway: String,
    pub aws_region: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub head_host: String,
    pub head_port: u16,
    pub sn_port: u16,
    pub dn_port: u16,
    pub an_port: u16,
    pub target_sn_count: usize,
    pub target_dn_count: usize,
    pub max_tcp_connections: usize,
    pub head_sleep_time: u64,
    pub node_sleep_time: u64,
    pub async_sleep_time: u64,
    pub s3_sync_interval: u64,
    pub max_chunks_per_request: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    pub timeout: u64,
    pub allow_noauth: bool,
    pub max_task_count: usize,
    pub log_level: String,
    pub metadata_mem_cache_size: usize,
    pub chunk_mem_cache_size: usize,
    pub max_chunk_wait_time: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bucket_name: "tessera".to_string(),
            aws_s3_gateway: "file:///var/lib/tessera".to_string(),
            aws_region: "us-east-1".to_string(),
            aws_access_key_id: String::new(),
            aws_secret_access_key: String::new(),
            head_host: "localhost".to_string(),
            head_port: 5100,
            dn_port: 5101,
            sn_port: 5102,
            an_port: 0,
            target_sn_count: 4,
            target_dn_count: 4,
            max_tcp_connections: 16,
            head_sleep_time: 10,
            node_sleep_time: 10,
            async_sleep_time: 10,
            s3_sync_interval: 30,
            max_chunks_per_request: 1000,
            min_chunk_size: 40,
            max_chunk_size: 4 * 1024 * 1024,
            timeout: 30,
            allow_noauth: true,
            max_task_count: 100,
            log_level: "info".to_string(),
            metadata_mem_cache_size: 128 * 1024,
            chunk_mem_cache_size: 128 * 1024 * 1024,
            max_chunk_wait_time: 10,
        }
    }
}

fn lookup(overrides: &HashMap<String, String>, key: &str) -> Option<String> {
    if let Some(val) = overrides.get(key) {
        return Some(val.clone());
    }
    std::env::var(key.to_uppercase()).ok()
}

macro_rules! resolve {
    ($cfg:ident, $overrides:ident, $field:ident) => {
        if let Some(val) = lookup(&$overrides, stringify!($field)) {
            $cfg.$field = val
                .parse()
                .map_err(|_| anyhow::format_err!(
                    "unable to parse config value for '{}': '{}'",
                    stringify!($field),
                    val,
                ))?;
        }
    };
}

impl Config {
    /// Resolve the configuration from `--key=val` style arguments and
    /// the environment.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<Self, Error> {
        let mut overrides = HashMap::new();
        for arg in args {
            if let Some(rest) = arg.strip_prefix("--") {
                match rest.find('=') {
                    Some(pos) => {
                        overrides.insert(rest[..pos].to_string(), rest[pos + 1..].to_string());
                    }
                    None => bail!("expected --key=val, got '{}'", arg),
                }
            } else {
                bail!("unexpected argument '{}'", arg);
            }
        }

        let mut cfg = Config::default();
        resolve!(cfg, overrides, bucket_name);
        resolve!(cfg, overrides, aws_s3_gateway);
        resolve!(cfg, overrides, aws_region);
        resolve!(cfg, overrides, aws_access_key_id);
        resolve!(cfg, overrides, aws_secret_access_key);
        resolve!(cfg, overrides, head_host);
        resolve!(cfg, overrides, head_port);
        resolve!(cfg, overrides, sn_port);
        resolve!(cfg, overrides, dn_port);
        resolve!(cfg, overrides, an_port);
        resolve!(cfg, overrides, target_sn_count);
        resolve!(cfg, overrides, target_dn_count);
        resolve!(cfg, overrides, max_tcp_connections);
        resolve!(cfg, overrides, head_sleep_time);
        resolve!(cfg, overrides, node_sleep_time);
        resolve!(cfg, overrides, async_sleep_time);
        resolve!(cfg, overrides, s3_sync_interval);
        resolve!(cfg, overrides, max_chunks_per_request);
        resolve!(cfg, overrides, min_chunk_size);
        resolve!(cfg, overrides, max_chunk_size);
        resolve!(cfg, overrides, timeout);
        resolve!(cfg, overrides, allow_noauth);
        resolve!(cfg, overrides, max_task_count);
        resolve!(cfg, overrides, log_level);
        resolve!(cfg, overrides, metadata_mem_cache_size);
        resolve!(cfg, overrides, chunk_mem_cache_size);
        resolve!(cfg, overrides, max_chunk_wait_time);

        if cfg.bucket_name.is_empty() {
            bail!("bucket_name must not be empty");
        }
        if cfg.target_dn_count == 0 {
            bail!("target_dn_count must be at least 1");
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::from_args(Vec::new()).unwrap();
        assert_eq!(cfg.head_port, 5100);
        assert_eq!(cfg.max_chunks_per_request, 1000);
        assert!(cfg.allow_noauth);
    }

    #[test]
    fn test_command_line_override() {
        let args = vec![
            "--sn_port=6102".to_string(),
            "--allow_noauth=false".to_string(),
            "--bucket_name=mybucket".to_string(),
        ];
        let cfg = Config::from_args(args).unwrap();
        assert_eq!(cfg.sn_port, 6102);
        assert!(!cfg.allow_noauth);
        assert_eq!(cfg.bucket_name, "mybucket");
    }

    #[test]
    fn test_bad_argument() {
        assert!(Config::from_args(vec!["--sn_port".to_string()]).is_err());
        assert!(Config::from_args(vec!["sn_port=1".to_string()]).is_err());
        assert!(Config::from_args(vec!["--sn_port=notaport".to_string()]).is_err());
    }
}
