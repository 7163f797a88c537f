const BYTE_UNITS: [&str; 4] = ["bytes", "KiB", "MiB", "GiB"];
const COUNT_UNITS: [&str; 2] = ["K", "M"];

/// Divides `value` by `step` until it fits the next unit label, starting
/// at `units[0]` unscaled. Values beyond the last unit stay in it.
fn scale_to_unit(value: f64, step: f64, units: &[&'static str]) -> (f64, &'static str) {
    let mut scaled = value;
    let mut unit = units[0];
    for &next in &units[1..] {
        if scaled <= step {
            break;
        }
        scaled /= step;
        unit = next;
    }
    (scaled, unit)
}

pub fn pretty_bytes_size(len: u64) -> String {
    let (value, unit) = scale_to_unit(len as f64, 1024.0, &BYTE_UNITS);
    format!("{value:.2}{unit}")
}

pub fn pretty_count(count: u64) -> String {
    if count < 1_000 {
        return format!("{count}");
    }
    let (value, unit) = scale_to_unit(count as f64 / 1_000.0, 1_000.0, &COUNT_UNITS);
    if unit == "K" {
        format!("{value:.1}{unit}")
    } else {
        format!("{value:.2}{unit}")
    }
}
