use std::time::Duration;

use crate::error::Error;

pub(crate) fn record_ok(
    mode: &'static str,
    netfn: u8,
    cmd: u8,
    elapsed: Duration,
    completion_code: u8,
) {
    let _ = (mode, netfn, cmd, elapsed, completion_code);

    #[cfg(feature = "metrics")]
    {
        metrics::counter!("ipmi_requests_total", "mode" => mode, "outcome" => "ok").increment(1);
        metrics::histogram!("ipmi_request_seconds", "mode" => mode).record(elapsed.as_secs_f64());
        if completion_code != 0x00 {
            metrics::counter!("ipmi_completion_code_nonzero_total", "mode" => mode).increment(1);
        }
    }

    #[cfg(feature = "tracing")]
    {
        tracing::debug!(
            mode,
            netfn,
            cmd,
            completion_code,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "ipmi request ok"
        );
    }
}

pub(crate) fn record_err(mode: &'static str, netfn: u8, cmd: u8, elapsed: Duration, err: &Error) {
    let _ = (mode, netfn, cmd, elapsed, err);

    #[cfg(feature = "metrics")]
    {
        metrics::counter!("ipmi_requests_total", "mode" => mode, "outcome" => "err").increment(1);
        metrics::counter!(
            "ipmi_request_errors_total",
            "mode" => mode,
            "kind" => error_kind(err)
        )
        .increment(1);
        metrics::histogram!("ipmi_request_seconds", "mode" => mode).record(elapsed.as_secs_f64());
    }

    #[cfg(feature = "tracing")]
    {
        tracing::warn!(
            mode,
            netfn,
            cmd,
            error = %err,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "ipmi request failed"
        );
    }
}

/// The repository cancelled a reservation and a new one was acquired.
pub(crate) fn reservation_renewed(reservation_id: u16, attempt: u32) {
    let _ = (reservation_id, attempt);

    #[cfg(feature = "metrics")]
    metrics::counter!("ipmi_sdr_reservation_renewals_total").increment(1);

    #[cfg(feature = "tracing")]
    tracing::debug!(reservation_id, attempt, "sdr reservation renewed");
}

/// The BMC refused a chunk size and the read was retried with a smaller one.
pub(crate) fn chunk_shrunk(record_id: u16, offset: usize, chunk_size: u8) {
    let _ = (record_id, offset, chunk_size);

    #[cfg(feature = "metrics")]
    metrics::counter!("ipmi_sdr_chunk_shrinks_total").increment(1);

    #[cfg(feature = "tracing")]
    tracing::debug!(record_id, offset, chunk_size, "sdr chunk size reduced");
}

pub(crate) fn cache_created(record_count: u32, elapsed: Duration) {
    let _ = (record_count, elapsed);

    #[cfg(feature = "metrics")]
    {
        metrics::counter!("ipmi_sdr_cache_builds_total", "outcome" => "ok").increment(1);
        metrics::histogram!("ipmi_sdr_cache_build_seconds").record(elapsed.as_secs_f64());
    }

    #[cfg(feature = "tracing")]
    tracing::info!(
        record_count,
        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
        "sdr cache created"
    );
}

pub(crate) fn cache_failed(err: &Error, elapsed: Duration) {
    let _ = (err, elapsed);

    #[cfg(feature = "metrics")]
    metrics::counter!(
        "ipmi_sdr_cache_builds_total",
        "outcome" => "err",
        "kind" => error_kind(err)
    )
    .increment(1);

    #[cfg(feature = "tracing")]
    tracing::warn!(
        error = %err,
        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
        "sdr cache creation failed"
    );
}

#[cfg(feature = "metrics")]
fn error_kind(err: &Error) -> &'static str {
    match err {
        Error::Io(_) => "io",
        Error::Timeout => "timeout",
        Error::Protocol(_) | Error::ProtocolOwned(_) => "protocol",
        Error::AuthenticationFailed(_) => "authentication",
        Error::Crypto(_) => "crypto",
        Error::Unsupported(_) => "unsupported",
        Error::InvalidArgument(_) => "invalid_argument",
        Error::CompletionCode { .. } => "completion_code",
        Error::FieldLength { .. }
        | Error::TrailingBytes { .. }
        | Error::UnknownField(_)
        | Error::FieldNotSet(_)
        | Error::FieldOverflow { .. } => "codec",
        Error::CacheExists(_)
        | Error::Permission(_)
        | Error::FilenameInvalid(_)
        | Error::Filesystem(_) => "filesystem",
        Error::InvalidRecordLength { .. }
        | Error::InvalidRecordCount { .. }
        | Error::DuplicateRecordId(_)
        | Error::DuplicateSensorNumber(_) => "consistency",
        Error::ReservationRetriesExhausted { .. } => "reservation",
        Error::CacheFormat(_) => "cache_format",
    }
}
