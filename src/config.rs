use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::uop::fu_mask_from_name;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("config error: {0}")]
    Config(String),
    #[error("program load error: {0}")]
    Load(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("guest exception {0} at rip {1:#x}")]
    GuestException(&'static str, u64),
    #[error("pipeline deadlock: no commit for {0} cycles")]
    Deadlock(u64),
    #[error("unsupported mode: {0}")]
    Unsupported(&'static str),
}

#[derive(Clone, Deserialize, Debug)]
pub struct ClusterConfig {
    pub name: String,
    pub issue_width: usize,
    // functional units local to this cluster, by name
    pub fu: Vec<String>,
}

impl ClusterConfig {
    pub fn fu_mask(&self) -> Result<u32, SimError> {
        let mut mask = 0;
        for name in &self.fu {
            mask |= fu_mask_from_name(name)
                .ok_or_else(|| SimError::Config(format!("unknown functional unit '{}'", name)))?;
        }
        Ok(mask)
    }
}

/// The machine description: queue sizes, widths, latencies and the cluster
/// topology. Loaded from YAML when a file is given, otherwise the defaults
/// below describe the built-in machine.
#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct CoreConfig {
    pub rob_size: usize,
    // allocatable physical registers, including the zero sentinel at index 0
    pub phys_reg_count: usize,
    pub ldq_size: usize,
    pub stq_size: usize,
    pub fetch_width: usize,
    pub fetchq_size: usize,
    pub frontend_width: usize,
    pub frontend_stages: u8,
    pub dispatch_width: usize,
    pub writeback_width: usize,
    pub commit_width: usize,
    // per-cluster issue queue size; at most 64
    pub iq_size: usize,
    pub load_latency: u8,
    pub miss_latency: u8,
    pub icache_miss_latency: u8,
    pub lfrq_size: usize,
    pub missbuf_size: usize,
    pub lsap_size: usize,
    pub virt_addr_bits: u8,
    pub icache_line_shift: u8,
    pub icache_lines: usize,
    pub dcache_line_shift: u8,
    pub dcache_lines: usize,
    pub clusters: Vec<ClusterConfig>,
    // [src][dst] forwarding latency in cycles
    pub intercluster_latency: Vec<Vec<u8>>,
}

impl Default for CoreConfig {
    fn default() -> CoreConfig {
        CoreConfig {
            rob_size: 64,
            phys_reg_count: 128,
            ldq_size: 16,
            stq_size: 16,
            fetch_width: 4,
            fetchq_size: 16,
            frontend_width: 4,
            frontend_stages: 4,
            dispatch_width: 4,
            writeback_width: 4,
            commit_width: 4,
            iq_size: 16,
            load_latency: 2,
            miss_latency: 14,
            icache_miss_latency: 10,
            lfrq_size: 8,
            missbuf_size: 4,
            lsap_size: 16,
            virt_addr_bits: 48,
            icache_line_shift: 6,
            icache_lines: 512,
            dcache_line_shift: 6,
            dcache_lines: 512,
            clusters: vec![
                ClusterConfig {
                    name: "int0".to_string(),
                    issue_width: 2,
                    fu: vec!["alu0".to_string(), "ldu0".to_string(), "stu0".to_string()],
                },
                ClusterConfig {
                    name: "int1".to_string(),
                    issue_width: 2,
                    fu: vec!["alu1".to_string(), "ldu1".to_string(), "stu1".to_string()],
                },
                ClusterConfig {
                    name: "fp".to_string(),
                    issue_width: 2,
                    fu: vec!["fpu0".to_string(), "fpu1".to_string()],
                },
            ],
            intercluster_latency: vec![vec![0, 1, 2], vec![1, 0, 2], vec![2, 2, 0]],
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        if self.iq_size > 64 {
            return Err(SimError::Config("iq_size must be at most 64".to_string()));
        }
        if self.clusters.is_empty() || self.clusters.len() > 8 {
            return Err(SimError::Config(
                "between 1 and 8 clusters are supported".to_string(),
            ));
        }
        let n = self.clusters.len();
        if self.intercluster_latency.len() != n
            || self.intercluster_latency.iter().any(|row| row.len() != n)
        {
            return Err(SimError::Config(format!(
                "intercluster_latency must be a {}x{} matrix",
                n, n
            )));
        }
        if self.phys_reg_count < 2 {
            return Err(SimError::Config("phys_reg_count too small".to_string()));
        }
        for cl in &self.clusters {
            cl.fu_mask()?;
        }
        Ok(())
    }

    pub fn max_forwarding_latency(&self) -> u8 {
        self.intercluster_latency
            .iter()
            .flat_map(|row| row.iter().copied())
            .max()
            .unwrap_or(0)
    }

    pub fn virt_addr_mask(&self) -> u64 {
        if self.virt_addr_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.virt_addr_bits) - 1
        }
    }
}

pub fn load_core_config(file_path: &Path) -> Result<CoreConfig, SimError> {
    let file = File::open(file_path)?;
    let config: CoreConfig = serde_yaml::from_reader(file)?;
    config.validate()?;
    Ok(config)
}

const NO_LIMIT: u64 = u64::MAX;

/// Per-run simulation options, read from the program's companion conf file.
#[derive(Clone, Debug)]
pub struct SimOptions {
    pub logfile: PathBuf,
    pub loglevel: u64,
    pub startlog: u64,
    pub shortlog: u64,
    pub stats: Option<PathBuf>,
    pub snapshot: u64,
    pub startrip: Option<u64>,
    pub startrepeat: u64,
    pub excludeld: bool,
    pub trigger: bool,
    pub stop: u64,
    pub stoprip: Option<u64>,
    pub bbinsns: u64,
    pub stopinsns: u64,
    pub flushevery: u64,
    pub profonly: bool,
    pub forceseq: u64,
    pub allseq: bool,
    pub exitend: bool,
    pub dumpcode: Option<PathBuf>,
    pub perfect_cache: bool,
    pub ooo: bool,
}

impl Default for SimOptions {
    fn default() -> SimOptions {
        SimOptions {
            logfile: PathBuf::from("oosim.log"),
            loglevel: 0,
            startlog: NO_LIMIT,
            shortlog: NO_LIMIT,
            stats: None,
            snapshot: NO_LIMIT,
            startrip: None,
            startrepeat: 1,
            excludeld: false,
            trigger: false,
            stop: NO_LIMIT,
            stoprip: None,
            bbinsns: 65536,
            stopinsns: NO_LIMIT,
            flushevery: NO_LIMIT,
            profonly: false,
            forceseq: NO_LIMIT,
            allseq: false,
            exitend: false,
            dumpcode: None,
            perfect_cache: false,
            ooo: true,
        }
    }
}

/// Parse a decimal number with an optional k/m/g/t scale suffix. Hex values
/// are accepted with an 0x prefix and take no suffix.
pub fn parse_scaled(token: &str) -> Result<u64, SimError> {
    let token = token.trim();
    if let Some(hex) = token.strip_prefix("0x") {
        return u64::from_str_radix(hex, 16)
            .map_err(|_| SimError::Config(format!("bad hex value '{}'", token)));
    }
    let (digits, scale) = match token.chars().last() {
        Some('k') | Some('K') => (&token[..token.len() - 1], 1_000u64),
        Some('m') | Some('M') => (&token[..token.len() - 1], 1_000_000),
        Some('g') | Some('G') => (&token[..token.len() - 1], 1_000_000_000),
        Some('t') | Some('T') => (&token[..token.len() - 1], 1_000_000_000_000),
        _ => (token, 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| SimError::Config(format!("bad numeric value '{}'", token)))?;
    value
        .checked_mul(scale)
        .ok_or_else(|| SimError::Config(format!("value '{}' out of range", token)))
}

impl SimOptions {
    /// The conf file location for a given program: the program's absolute
    /// path appended to `$HOME/.oosim`, with a `.conf` suffix.
    pub fn conf_path_for(program: &Path) -> Option<PathBuf> {
        let home = std::env::var_os("HOME")?;
        let abs = program.canonicalize().ok()?;
        Some(PathBuf::from(format!(
            "{}/.oosim{}.conf",
            home.to_string_lossy(),
            abs.display()
        )))
    }

    pub fn load_for(program: &Path) -> Result<SimOptions, SimError> {
        let mut opts = SimOptions::default();
        if let Some(path) = Self::conf_path_for(program) {
            if path.exists() {
                let text = std::fs::read_to_string(&path)?;
                opts.apply_tokens(&text)?;
            }
        }
        Ok(opts)
    }

    /// Apply whitespace-separated `-option value` pairs; boolean options take
    /// no value.
    pub fn apply_tokens(&mut self, text: &str) -> Result<(), SimError> {
        fn value<'a>(
            tokens: &mut impl Iterator<Item = &'a str>,
            name: &str,
        ) -> Result<&'a str, SimError> {
            tokens
                .next()
                .ok_or_else(|| SimError::Config(format!("option -{} needs a value", name)))
        }

        let mut tokens = text.split_whitespace();
        while let Some(token) = tokens.next() {
            let name = token
                .strip_prefix('-')
                .ok_or_else(|| SimError::Config(format!("expected option, got '{}'", token)))?;
            match name {
                "logfile" => self.logfile = PathBuf::from(value(&mut tokens, name)?),
                "loglevel" => self.loglevel = parse_scaled(value(&mut tokens, name)?)?,
                "startlog" => self.startlog = parse_scaled(value(&mut tokens, name)?)?,
                "shortlog" => self.shortlog = parse_scaled(value(&mut tokens, name)?)?,
                "stats" => self.stats = Some(PathBuf::from(value(&mut tokens, name)?)),
                "snapshot" => self.snapshot = parse_scaled(value(&mut tokens, name)?)?,
                "startrip" => self.startrip = Some(parse_scaled(value(&mut tokens, name)?)?),
                "startrepeat" => self.startrepeat = parse_scaled(value(&mut tokens, name)?)?,
                "excludeld" => self.excludeld = true,
                "trigger" => self.trigger = true,
                "stop" => self.stop = parse_scaled(value(&mut tokens, name)?)?,
                "stoprip" => self.stoprip = Some(parse_scaled(value(&mut tokens, name)?)?),
                "bbinsns" => self.bbinsns = parse_scaled(value(&mut tokens, name)?)?,
                "stopinsns" => self.stopinsns = parse_scaled(value(&mut tokens, name)?)?,
                "flushevery" => self.flushevery = parse_scaled(value(&mut tokens, name)?)?,
                "profonly" => self.profonly = true,
                "forceseq" => self.forceseq = parse_scaled(value(&mut tokens, name)?)?,
                "allseq" => self.allseq = true,
                "exitend" => self.exitend = true,
                "dumpcode" => self.dumpcode = Some(PathBuf::from(value(&mut tokens, name)?)),
                "perfect-cache" => self.perfect_cache = true,
                "ooo" => self.ooo = true,
                _ => return Err(SimError::Config(format!("unknown option -{}", name))),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scaled_suffixes() {
        assert_eq!(parse_scaled("17").unwrap(), 17);
        assert_eq!(parse_scaled("4k").unwrap(), 4_000);
        assert_eq!(parse_scaled("2M").unwrap(), 2_000_000);
        assert_eq!(parse_scaled("1g").unwrap(), 1_000_000_000);
        assert_eq!(parse_scaled("3T").unwrap(), 3_000_000_000_000);
        assert_eq!(parse_scaled("0x40").unwrap(), 64);
        assert!(parse_scaled("12q").is_err());
    }

    #[test]
    fn test_apply_tokens() {
        let mut opts = SimOptions::default();
        opts.apply_tokens("-stop 100k -loglevel 2 -perfect-cache -logfile run.log")
            .unwrap();
        assert_eq!(opts.stop, 100_000);
        assert_eq!(opts.loglevel, 2);
        assert!(opts.perfect_cache);
        assert_eq!(opts.logfile, PathBuf::from("run.log"));
        assert!(opts.apply_tokens("-nosuchoption 1").is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = CoreConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_forwarding_latency(), 2);
    }
}
