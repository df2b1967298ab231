use std::error::Error;

use crate::stratus::util::new_error;

/// Parse a CPU quantity ("500m", "0.5", "2") into millicores.
pub fn parse_cpu(input: &str) -> Result<i64, Box<dyn Error + Send + Sync>> {
    if let Some(milli) = input.strip_suffix('m') {
        return milli
            .parse::<i64>()
            .map_err(|_| new_error(format!("invalid CPU millicore value: {milli}")));
    }

    let cores: f64 = input
        .parse()
        .map_err(|_| new_error(format!("invalid CPU value: {input}")))?;
    Ok((cores * 1000.0) as i64)
}

/// Parse a memory quantity ("256Mi", "1G", "512") into bytes. Binary
/// suffixes (Ki, Mi, Gi, Ti) are powers of 1024; decimal suffixes
/// (K, M, G, T) are powers of 1000; B or no suffix means bytes.
pub fn parse_memory(input: &str) -> Result<i64, Box<dyn Error + Send + Sync>> {
    if input.is_empty() {
        return Err(new_error("empty memory string"));
    }

    let (value, multiplier): (&str, i64) = if let Some(rest) = input.strip_suffix("Ki") {
        (rest, 1 << 10)
    } else if let Some(rest) = input.strip_suffix("Mi") {
        (rest, 1 << 20)
    } else if let Some(rest) = input.strip_suffix("Gi") {
        (rest, 1 << 30)
    } else if let Some(rest) = input.strip_suffix("Ti") {
        (rest, 1 << 40)
    } else if let Some(rest) = input.strip_suffix('K') {
        (rest, 1_000)
    } else if let Some(rest) = input.strip_suffix('M') {
        (rest, 1_000_000)
    } else if let Some(rest) = input.strip_suffix('G') {
        (rest, 1_000_000_000)
    } else if let Some(rest) = input.strip_suffix('T') {
        (rest, 1_000_000_000_000)
    } else if let Some(rest) = input.strip_suffix('B') {
        (rest, 1)
    } else {
        (input, 1)
    };

    let amount: f64 = value
        .parse()
        .map_err(|_| new_error(format!("invalid memory value: {value}")))?;
    if amount < 0.0 {
        return Err(new_error(format!("negative memory value: {value}")));
    }
    Ok((amount * multiplier as f64) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_millicores_and_cores() {
        assert_eq!(parse_cpu("500m").unwrap(), 500);
        assert_eq!(parse_cpu("0.5").unwrap(), 500);
        assert_eq!(parse_cpu("2").unwrap(), 2000);
        assert_eq!(parse_cpu("3.5").unwrap(), 3500);
    }

    #[test]
    fn cpu_rejects_garbage() {
        assert!(parse_cpu("100X").is_err());
        assert!(parse_cpu("abcm").is_err());
        assert!(parse_cpu("").is_err());
    }

    #[test]
    fn memory_binary_suffixes() {
        assert_eq!(parse_memory("256Mi").unwrap(), 256 * (1 << 20));
        assert_eq!(parse_memory("1Gi").unwrap(), 1 << 30);
        assert_eq!(parse_memory("4Ki").unwrap(), 4096);
        assert_eq!(parse_memory("2Ti").unwrap(), 2 * (1_i64 << 40));
    }

    #[test]
    fn memory_decimal_suffixes_and_bytes() {
        assert_eq!(parse_memory("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_memory("5K").unwrap(), 5_000);
        assert_eq!(parse_memory("12M").unwrap(), 12_000_000);
        assert_eq!(parse_memory("64B").unwrap(), 64);
        assert_eq!(parse_memory("128").unwrap(), 128);
        assert_eq!(parse_memory("0.5Gi").unwrap(), 1 << 29);
    }

    #[test]
    fn memory_rejects_garbage() {
        assert!(parse_memory("").is_err());
        assert!(parse_memory("100X").is_err());
        assert!(parse_memory("xyzMi").is_err());
        assert!(parse_memory("-1Gi").is_err());
    }
}
