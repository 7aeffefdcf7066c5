use crate::error::{Error, Result};
use std::{collections::HashMap, path::Path};
use tch::{nn, Tensor};
use tracing::{debug, info};

/// Read every named tensor from a `.npz` archive or a libtorch named-tensor archive.
pub fn read_named_tensors(path: &Path) -> Result<Vec<(String, Tensor)>> {
    let named = match path.extension().and_then(|ext| ext.to_str()) {
        Some("npz") => Tensor::read_npz(path)?,
        _ => Tensor::load_multi(path)?,
    };
    Ok(named)
}

/// Copy the entries stored under `key.` into the variables of `vs`.
///
/// Every variable must be present with a matching shape. Entries without a
/// matching variable (blur buffers, optimizer state, other networks) are skipped.
/// Returns the number of variables restored.
pub fn restore(vs: &nn::VarStore, named: Vec<(String, Tensor)>, key: &str) -> Result<usize> {
    let prefix = format!("{}.", key);
    let mut entries = named
        .into_iter()
        .filter_map(|(name, t)| name.strip_prefix(&prefix).map(|n| (n.to_string(), t)))
        .collect::<HashMap<_, _>>();
    if entries.is_empty() {
        return Err(Error::MissingCheckpointKey {
            key: key.to_string(),
        });
    }

    let mut variables = vs.variables().into_iter().collect::<Vec<_>>();
    variables.sort_by(|a, b| a.0.cmp(&b.0));
    let restored = variables.len();
    tch::no_grad(|| -> Result<()> {
        for (name, mut var) in variables {
            let src = entries
                .remove(&name)
                .ok_or_else(|| Error::MissingWeight(name.clone()))?;
            if src.size() != var.size() {
                return Err(Error::ShapeMismatch {
                    name,
                    expected: var.size(),
                    got: src.size(),
                });
            }
            var.copy_(&src);
        }
        Ok(())
    })?;
    for name in entries.keys() {
        debug!("skipping checkpoint entry {}.{}", key, name);
    }
    Ok(restored)
}

/// Load generator weights from `path` and freeze them for inference.
pub fn load(vs: &mut nn::VarStore, path: &Path, key: &str) -> Result<()> {
    let named = read_named_tensors(path)?;
    debug!("read {} tensors from {:?}", named.len(), path);
    let restored = restore(vs, named, key)?;
    vs.freeze();
    info!("restored {} weights from {:?} [{}]", restored, path, key);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn store() -> nn::VarStore {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let _ = root.zeros("weight", &[2, 3]);
        let _ = (&root / "block").zeros("bias", &[4]);
        vs
    }

    fn entry(name: &str, dims: &[i64], value: f64) -> (String, Tensor) {
        (
            name.to_string(),
            Tensor::ones(dims, (Kind::Float, Device::Cpu)) * value,
        )
    }

    #[test]
    fn restores_prefixed_entries() {
        let vs = store();
        let named = vec![
            entry("g_running.weight", &[2, 3], 1.5),
            entry("g_running.block.bias", &[4], -2.),
            entry("g_running.generator.progression.5.conv1.1.weight", &[16, 1, 3, 3], 1.),
            entry("generator.weight", &[2, 3], 9.),
        ];
        assert_eq!(restore(&vs, named, "g_running").unwrap(), 2);
        let variables = vs.variables();
        assert_eq!(variables["weight"].double_value(&[1, 2]), 1.5);
        assert_eq!(variables["block.bias"].double_value(&[3]), -2.);
    }

    #[test]
    fn rejects_unknown_key() {
        let vs = store();
        let named = vec![entry("generator.weight", &[2, 3], 1.)];
        assert!(matches!(
            restore(&vs, named, "g_running"),
            Err(Error::MissingCheckpointKey { key }) if key == "g_running"
        ));
    }

    #[test]
    fn rejects_missing_weight() {
        let vs = store();
        let named = vec![entry("g_running.weight", &[2, 3], 1.)];
        assert!(matches!(
            restore(&vs, named, "g_running"),
            Err(Error::MissingWeight(name)) if name == "block.bias"
        ));
    }

    #[test]
    fn rejects_shape_mismatch() {
        let vs = store();
        let named = vec![
            entry("g_running.weight", &[3, 2], 1.),
            entry("g_running.block.bias", &[4], 1.),
        ];
        match restore(&vs, named, "g_running") {
            Err(Error::ShapeMismatch { name, expected, got }) => {
                assert_eq!(name, "weight");
                assert_eq!(expected, [2, 3]);
                assert_eq!(got, [3, 2]);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn loads_named_tensor_archive() {
        let path = std::env::temp_dir().join(format!("stylegan-sample-{}.ot", std::process::id()));
        let named = vec![
            entry("g_running.weight", &[2, 3], 0.5),
            entry("g_running.block.bias", &[4], 3.),
        ];
        Tensor::save_multi(&named, &path).unwrap();
        let mut vs = store();
        load(&mut vs, &path, "g_running").unwrap();
        std::fs::remove_file(&path).unwrap();
        let variables = vs.variables();
        assert_eq!(variables["weight"].double_value(&[0, 0]), 0.5);
        assert_eq!(variables["block.bias"].double_value(&[0]), 3.);
        assert!(!variables["weight"].requires_grad());
    }

    #[test]
    fn loads_npz_archive() {
        let path = std::env::temp_dir().join(format!("stylegan-sample-{}.npz", std::process::id()));
        let named = vec![
            entry("g_running.weight", &[2, 3], -0.25),
            entry("g_running.block.bias", &[4], 7.),
            entry("d_running.weight", &[2, 3], 1.),
        ];
        Tensor::write_npz(&named, &path).unwrap();
        let mut vs = store();
        load(&mut vs, &path, "g_running").unwrap();
        std::fs::remove_file(&path).unwrap();
        let variables = vs.variables();
        assert_eq!(variables["weight"].double_value(&[1, 1]), -0.25);
        assert_eq!(variables["block.bias"].double_value(&[2]), 7.);
    }
}
