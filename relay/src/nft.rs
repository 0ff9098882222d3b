//! Programs the nftables redirect that steers application traffic into the
//! relay.
//!
//! Everything lives in a dedicated `inet` table so that removing it removes
//! every object the relay ever created:
//!
//! ```text
//! table inet appsecgw {
//!     set appsecgw-ips-set { type ipv4_addr; }
//!     chain prerouting {
//!         type nat hook prerouting priority dstnat;
//!         ip saddr != @appsecgw-ips-set tcp dport <app> redirect to :<relay>
//!     }
//! }
//! ```

use serde::Deserialize;
use std::{collections::HashMap, fmt, io, net::Ipv4Addr, path::PathBuf, process::Stdio};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, info};

pub const TABLE: &str = "appsecgw";
pub const CHAIN: &str = "prerouting";
pub const GATEWAY_SET: &str = "appsecgw-ips-set";
pub const OWNED_COMMENT: &str = "appsecgw-owned-object";

#[derive(Debug, thiserror::Error)]
pub enum NftError {
    #[error("failed to run nft: {0}")]
    Exec(#[from] io::Error),

    #[error("nft failed ({status}): {stderr}")]
    Failed { status: String, stderr: String },

    #[error("invalid nft output: {0}")]
    Json(#[from] serde_json::Error),
}

/// Access to the namespace's nftables ruleset.
#[async_trait::async_trait]
pub trait Nft: Send + Sync + 'static {
    /// The comments of every rule in the relay chain, or `None` if the chain
    /// does not exist.
    async fn chain_rules(&self) -> Result<Option<Vec<Option<String>>>, NftError>;

    /// Applies all commands of the transaction atomically.
    async fn run(&self, tx: &Transaction) -> Result<(), NftError>;
}

/// Drives the `nft` command-line tool.
#[derive(Clone, Debug)]
pub struct NftCli {
    binary: PathBuf,
}

/// A batch of nft commands, applied all-or-nothing with `nft -f`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transaction {
    commands: Vec<String>,
}

/// The traffic to redirect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Redirect {
    /// Sources that bypass the redirect, so the gateway can reach the
    /// application.
    pub gateway_ips: Vec<Ipv4Addr>,
    pub app_port: u16,
    pub relay_port: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op<'a> {
    Add(&'a Redirect),
    /// Removes whatever this or an earlier relay left in place.
    Delete,
}

pub struct Programmer<N> {
    nft: N,
}

#[derive(Debug, Deserialize)]
struct Ruleset {
    nftables: Vec<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct ChainObject {
    family: String,
    table: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RuleObject {
    family: String,
    table: String,
    chain: String,
    #[serde(default)]
    comment: Option<String>,
}

// === impl NftCli ===

impl NftCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait::async_trait]
impl Nft for NftCli {
    async fn chain_rules(&self) -> Result<Option<Vec<Option<String>>>, NftError> {
        let output = Command::new(&self.binary)
            .args(["--json", "list", "ruleset"])
            .output()
            .await?;
        if !output.status.success() {
            return Err(NftError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        parse_chain_rules(&output.stdout)
    }

    async fn run(&self, tx: &Transaction) -> Result<(), NftError> {
        let mut child = Command::new(&self.binary)
            .args(["-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(tx.to_string().as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(NftError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

fn parse_chain_rules(json: &[u8]) -> Result<Option<Vec<Option<String>>>, NftError> {
    let ruleset = serde_json::from_slice::<Ruleset>(json)?;
    let mut chain = None;
    for mut object in ruleset.nftables {
        if let Some(value) = object.remove("chain") {
            let c = serde_json::from_value::<ChainObject>(value)?;
            if c.family == "inet" && c.table == TABLE && c.name == CHAIN {
                chain.get_or_insert_with(Vec::new);
            }
        } else if let Some(value) = object.remove("rule") {
            let r = serde_json::from_value::<RuleObject>(value)?;
            if r.family == "inet" && r.table == TABLE && r.chain == CHAIN {
                chain.get_or_insert_with(Vec::new).push(r.comment);
            }
        }
    }
    Ok(chain)
}

// === impl Transaction ===

impl Transaction {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn push(&mut self, command: String) {
        self.commands.push(command);
    }

    /// Creates the table, chain, gateway set and redirect rule.
    pub fn add(&mut self, redirect: &Redirect) {
        self.push(format!("add table inet {TABLE}"));
        self.push(format!(
            "add chain inet {TABLE} {CHAIN} {{ type nat hook prerouting priority dstnat ; comment \"{OWNED_COMMENT}\" ; }}"
        ));
        self.push(format!(
            "add set inet {TABLE} {GATEWAY_SET} {{ type ipv4_addr ; comment \"{OWNED_COMMENT}\" ; }}"
        ));
        if !redirect.gateway_ips.is_empty() {
            let ips = redirect
                .gateway_ips
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            self.push(format!("add element inet {TABLE} {GATEWAY_SET} {{ {ips} }}"));
        }
        self.push(format!(
            "add rule inet {TABLE} {CHAIN} ip saddr != @{GATEWAY_SET} tcp dport {} redirect to :{} comment \"{OWNED_COMMENT}\"",
            redirect.app_port, redirect.relay_port,
        ));
    }

    /// Removes the table and everything in it.
    pub fn delete(&mut self) {
        self.push(format!("delete table inet {TABLE}"));
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for command in &self.commands {
            writeln!(f, "{command}")?;
        }
        Ok(())
    }
}

// === impl Programmer ===

impl<N: Nft> Programmer<N> {
    pub fn new(nft: N) -> Self {
        Self { nft }
    }

    /// Whether the relay chain carries a rule this relay created.
    pub async fn applied(&self) -> Result<bool, NftError> {
        let applied = match self.nft.chain_rules().await? {
            None => false,
            Some(comments) => comments
                .iter()
                .any(|c| c.as_deref() == Some(OWNED_COMMENT)),
        };
        Ok(applied)
    }

    /// Adds the redirect unless it is already in place, or deletes the
    /// table if it carries owned rules. Decided from the live ruleset only.
    pub async fn program(&self, op: Op<'_>) -> Result<(), NftError> {
        let applied = self.applied().await?;
        let mut tx = Transaction::default();
        match op {
            Op::Add(redirect) if !applied => tx.add(redirect),
            Op::Delete if applied => tx.delete(),
            _ => {}
        }

        if tx.is_empty() {
            debug!(?op, applied, "Nothing to program");
            return Ok(());
        }
        self.nft.run(&tx).await?;
        info!(?op, "Programmed nftables");
        Ok(())
    }
}
