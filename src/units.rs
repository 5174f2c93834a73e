//! Byte-size parsing and formatting shared by the engine logs and the CLI.

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

/// Parse sizes such as `4096`, `4K`, `1MiB` or `2 GB` (binary multiples).
pub fn parse_size_with_suffix(s: &str) -> Result<u64, String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err("size is empty".to_string());
    }
    let split_at = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    if split_at == 0 {
        return Err(format!("missing numeric value in '{}'", trimmed));
    }
    let (digits, suffix) = trimmed.split_at(split_at);
    let value = digits
        .parse::<u64>()
        .map_err(|_| format!("invalid number '{}' in '{}'", digits, trimmed))?;
    let multiplier = match suffix.trim_start().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => KIB,
        "M" | "MB" | "MIB" => MIB,
        "G" | "GB" | "GIB" => GIB,
        "T" | "TB" | "TIB" => TIB,
        other => return Err(format!("unknown size suffix '{}' in '{}'", other, trimmed)),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' overflows 64 bits", trimmed))
}

/// Scale `bytes` to the largest binary unit below 1024 of it.
pub fn format_bytes(bytes: u64) -> (f64, &'static str) {
    let b = bytes as f64;
    if bytes < KIB {
        (b, "Bytes")
    } else if bytes < MIB {
        (b / KIB as f64, "KiB")
    } else if bytes < GIB {
        (b / MIB as f64, "MiB")
    } else if bytes < TIB {
        (b / GIB as f64, "GiB")
    } else {
        (b / TIB as f64, "TiB")
    }
}

pub fn human_bytes(bytes: u64) -> String {
    let (value, unit) = format_bytes(bytes);
    if unit == "Bytes" {
        format!("{} {}", bytes, unit)
    } else {
        format!("{:.2} {}", value, unit)
    }
}
