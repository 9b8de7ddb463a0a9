pub(crate) fn enabled() -> bool {
    std::env::var("IPMI_DEBUG")
        .map(|v| !v.is_empty())
        .unwrap_or(false)
}

pub(crate) fn dump_hex(label: &str, bytes: &[u8]) {
    if !enabled() {
        return;
    }
    emit(&format_hex(label, bytes));
}

/// Dump one SDR record, labeled with its type.
///
/// `forced` dumps even when `IPMI_DEBUG` is unset.
pub(crate) fn dump_record(record: &[u8], forced: bool) {
    if !forced && !enabled() {
        return;
    }
    let label = format!(
        "sdr record {}",
        crate::sdr::record_type_description(record)
    );
    let out = format_hex(&label, record);
    if forced {
        #[cfg(feature = "tracing")]
        tracing::info!("{out}");

        #[cfg(not(feature = "tracing"))]
        eprintln!("{out}");
    } else {
        emit(&out);
    }
}

fn format_hex(label: &str, bytes: &[u8]) -> String {
    let mut out = String::with_capacity(label.len() + bytes.len() * 3 + 8);
    out.push_str(label);
    out.push_str(" (");
    out.push_str(&bytes.len().to_string());
    out.push_str("):");
    for b in bytes {
        out.push(' ');
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn emit(out: &str) {
    #[cfg(feature = "tracing")]
    tracing::trace!("{out}");

    #[cfg(not(feature = "tracing"))]
    eprintln!("{out}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_dump_format() {
        assert_eq!(
            format_hex("rq", &[0x06, 0x00, 0xff]),
            "rq (3): 06 00 ff"
        );
        assert_eq!(format_hex("empty", &[]), "empty (0):");
    }
}
