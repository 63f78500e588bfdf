use std::path::{Path, PathBuf};

use ethers::types::Bytes;
use eyre::{Context, ContextCompat};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::forge_utils::{ContractSpec, ForgeInspect, InspectField};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    /// Compiler output directory (hardhat `artifacts/` or foundry `out/`)
    pub dir: PathBuf,

    /// Foundry project to fall back to `forge inspect` in
    pub forge_root: Option<PathBuf>,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("artifacts"),
            forge_root: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractArtifact {
    pub bytecode: Bytes,
    pub deployed_bytecode: Option<Bytes>,
}

/// Hardhat stores a hex string, foundry an object with the hex under
/// `object`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BytecodeField {
    Hex(Bytes),
    Object { object: Bytes },
}

impl From<BytecodeField> for Bytes {
    fn from(value: BytecodeField) -> Self {
        match value {
            BytecodeField::Hex(bytes) => bytes,
            BytecodeField::Object { object } => object,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawArtifact {
    bytecode: BytecodeField,
    #[serde(default)]
    deployed_bytecode: Option<BytecodeField>,
}

impl ContractArtifact {
    pub fn from_json(content: &str) -> eyre::Result<Self> {
        let raw: RawArtifact = serde_json::from_str(content)?;

        let bytecode: Bytes = raw.bytecode.into();
        eyre::ensure!(
            !bytecode.is_empty(),
            "Artifact has no creation bytecode"
        );

        Ok(Self {
            bytecode,
            deployed_bytecode: raw
                .deployed_bytecode
                .map(Bytes::from)
                .filter(|code| !code.is_empty()),
        })
    }
}

pub struct Artifacts {
    config: ArtifactsConfig,
}

impl Artifacts {
    pub fn new(config: ArtifactsConfig) -> Self {
        Self { config }
    }

    #[instrument(skip(self))]
    pub async fn load(&self, contract: &str) -> eyre::Result<ContractArtifact> {
        if let Some(path) = find_artifact(&self.config.dir, contract).await? {
            debug!(path = %path.display(), "Found artifact");

            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Reading {}", path.display()))?;

            return ContractArtifact::from_json(&content)
                .with_context(|| format!("Parsing {}", path.display()));
        }

        let forge_root = self.config.forge_root.as_ref().with_context(|| {
            format!(
                "No artifact for {contract} in {}",
                self.config.dir.display()
            )
        })?;

        let spec = ContractSpec::parse(contract);

        let bytecode = ForgeInspect::new(spec.clone(), InspectField::Bytecode)
            .with_cwd(forge_root)
            .run()
            .await?;

        let deployed_bytecode =
            ForgeInspect::new(spec, InspectField::DeployedBytecode)
                .with_cwd(forge_root)
                .run()
                .await?;

        Ok(ContractArtifact {
            bytecode,
            deployed_bytecode: Some(deployed_bytecode)
                .filter(|code| !code.is_empty()),
        })
    }
}

/// Looks for `<contract>.json` anywhere below `dir`, skipping hardhat's
/// `.dbg.json` companions.
async fn find_artifact(
    dir: &Path,
    contract: &str,
) -> eyre::Result<Option<PathBuf>> {
    let file_name = format!("{contract}.json");

    if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(None);
    }

    let mut pending = vec![dir.to_owned()];

    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current)
            .await
            .with_context(|| format!("Listing {}", current.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if entry.file_name().to_string_lossy() == file_name {
                return Ok(Some(path));
            }
        }
    }

    Ok(None)
}
