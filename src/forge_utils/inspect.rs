use std::path::{Path, PathBuf};

use ethers::types::Bytes;
use strum::Display;
use tracing::{info, instrument};

use super::common::ContractSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum InspectField {
    #[strum(serialize = "bytecode")]
    Bytecode,
    #[strum(serialize = "deployedBytecode")]
    DeployedBytecode,
}

/// Reads compiled bytecode through `forge inspect`, for projects without
/// artifacts on disk.
pub struct ForgeInspect {
    cwd: Option<PathBuf>,
    contract_spec: ContractSpec,
    field: InspectField,
}

impl ForgeInspect {
    pub fn new(contract_spec: ContractSpec, field: InspectField) -> Self {
        Self {
            cwd: None,
            contract_spec,
            field,
        }
    }

    pub fn with_cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_owned());
        self
    }

    #[instrument(
        name = "forge_inspect",
        skip_all,
        fields(contract = %self.contract_spec, field = %self.field)
    )]
    pub async fn run(&self) -> eyre::Result<Bytes> {
        let mut cmd = tokio::process::Command::new("forge");

        cmd.arg("inspect");

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        cmd.arg(self.contract_spec.to_string());
        cmd.arg(self.field.to_string());

        info!("Inspecting contract with {cmd:#?}");

        let output = cmd.output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            eyre::bail!("forge inspect failed: {}", stderr);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);

        parse_hex_output(&stdout)
    }
}

fn parse_hex_output(stdout: &str) -> eyre::Result<Bytes> {
    let hex_str = stdout.trim();
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);

    Ok(Bytes::from(hex::decode(hex_str)?))
}
