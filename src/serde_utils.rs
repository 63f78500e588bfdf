use std::path::Path;

use eyre::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Documents are YAML unless the path ends in `.toml`.
fn is_toml(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "toml")
}

pub fn from_str<T>(path: &Path, content: &str) -> eyre::Result<T>
where
    T: DeserializeOwned,
{
    let value = if is_toml(path) {
        toml::from_str(content).with_context(|| {
            format!("Parsing {} content was {content}", path.display())
        })?
    } else {
        serde_yaml::from_str(content).with_context(|| {
            format!("Parsing {} content was {content}", path.display())
        })?
    };

    Ok(value)
}

pub async fn read_deserialize<T>(path: impl AsRef<Path>) -> eyre::Result<T>
where
    T: DeserializeOwned,
{
    let path = path.as_ref();

    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Reading from {}", path.display()))?;

    from_str(path, &content)
}

pub async fn write_serialize<T>(
    path: impl AsRef<Path>,
    value: T,
) -> eyre::Result<()>
where
    T: Serialize,
{
    let path = path.as_ref();

    let content = serde_yaml::to_string(&value)
        .with_context(|| format!("Serializing {}", path.display()))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Creating {}", parent.display()))?;
    }

    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Writing to {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use indoc::indoc;

    use super::*;

    #[test]
    fn picks_format_from_extension() -> eyre::Result<()> {
        let yaml: BTreeMap<String, u64> =
            from_str(Path::new("config.yml"), "a: 1\nb: 2\n")?;
        let toml: BTreeMap<String, u64> = from_str(
            Path::new("config.toml"),
            indoc! {"
                a = 1
                b = 2
            "},
        )?;

        assert_eq!(yaml, toml);

        Ok(())
    }

    #[tokio::test]
    async fn write_then_read() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("value.yml");

        let value = maplit::btreemap! { "x".to_string() => 7u64 };
        write_serialize(&path, &value).await?;

        let read: BTreeMap<String, u64> = read_deserialize(&path).await?;
        assert_eq!(read, value);

        Ok(())
    }
}
