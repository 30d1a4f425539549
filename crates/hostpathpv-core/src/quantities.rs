pub const KIB: i64 = 1024;
pub const MIB: i64 = 1024 * KIB;
pub const GIB: i64 = 1024 * MIB;
pub const TIB: i64 = 1024 * GIB;
pub const PIB: i64 = 1024 * TIB;

/// Storage quantities as they appear in volume specs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageQuantity {
    /// Size in bytes
    pub bytes: i64,
}

impl StorageQuantity {
    /// Parse a Kubernetes storage quantity (e.g., "10Gi", "500M", "1024", "1.5Gi")
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty quantity".to_string());
        }

        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
            .unwrap_or(s.len());
        let (num, suffix) = s.split_at(split);

        let multiplier: i64 = match suffix {
            "" => 1,
            "Ki" => KIB,
            "Mi" => MIB,
            "Gi" => GIB,
            "Ti" => TIB,
            "Pi" => PIB,
            "k" => 1_000,
            "M" => 1_000_000,
            "G" => 1_000_000_000,
            "T" => 1_000_000_000_000,
            "P" => 1_000_000_000_000_000,
            other => return Err(format!("Invalid quantity suffix '{}' in {}", other, s)),
        };

        let bytes = if let Ok(whole) = num.parse::<i64>() {
            whole
                .checked_mul(multiplier)
                .ok_or_else(|| format!("Quantity {} overflows", s))?
        } else {
            let frac = num
                .parse::<f64>()
                .map_err(|e| format!("Invalid quantity {}: {}", s, e))?;
            (frac * multiplier as f64).ceil() as i64
        };

        Ok(Self { bytes })
    }

    /// Read the `storage` entry of a k8s-openapi resource map
    pub fn from_k8s_resource_map(
        resources: &std::collections::BTreeMap<
            String,
            k8s_openapi::apimachinery::pkg::api::resource::Quantity,
        >,
    ) -> Option<Self> {
        resources
            .get("storage")
            .and_then(|q| Self::parse(&q.0).ok())
    }
}

/// Human readable byte size: `600 B`, `1.50KB`, `2.00GB`
pub fn format_bytes(bytes: i64) -> String {
    let b = bytes as f64;
    if bytes < KIB {
        format!("{} B", bytes)
    } else if bytes < MIB {
        format!("{:.2}KB", b / KIB as f64)
    } else if bytes < GIB {
        format!("{:.2}MB", b / MIB as f64)
    } else if bytes < TIB {
        format!("{:.2}GB", b / GIB as f64)
    } else if bytes < PIB {
        format!("{:.2}TB", b / TIB as f64)
    } else {
        format!("{:.2}PB", b / PIB as f64)
    }
}

/// Memory limit in the `Mi` form used by worker task resource limits
pub fn mebibytes(mib: u64) -> String {
    format!("{}Mi", mib)
}
