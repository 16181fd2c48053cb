//! Thin wrappers over the `metrics` facade so call sites stay terse and the
//! metric names live in one place. Summaries and timers are histograms on
//! the Prometheus side.

pub mod sip {
    /// One counter per SIP message, named after the CSeq method.
    pub fn message(
        cseq_method: &str,
        method: Option<&str>,
        status_code: Option<u16>,
        src_host: Option<&str>,
        dst_host: Option<&str>,
    ) {
        let status_type = status_code
            .map(|code| format!("{}xx", code / 100))
            .unwrap_or_default();
        metrics::counter!(
            format!("sip_{}_messages", cseq_method.to_lowercase()),
            "cseq_method" => cseq_method.to_string(),
            "method" => method.unwrap_or_default().to_string(),
            "status_type" => status_type,
            "status_code" => status_code.map(|c| c.to_string()).unwrap_or_default(),
            "src_host" => src_host.unwrap_or_default().to_string(),
            "dst_host" => dst_host.unwrap_or_default().to_string(),
        )
        .increment(1);
    }
}

pub mod rtpr {
    use crate::rtpr::RtpReportPayload;

    /// Per-report (or per-session aggregate) media quality metrics.
    /// `source` is `rtp` or `rtcp`.
    pub fn report(source: &str, report: &RtpReportPayload) {
        metrics::histogram!(format!("rtpr_{}_jitter", source)).record(report.avg_jitter);
        metrics::counter!(format!("rtpr_{}_expected_packets", source))
            .increment(report.expected_packets as u64);
        metrics::counter!(format!("rtpr_{}_lost_packets", source))
            .increment(report.lost_packets as u64);
        metrics::counter!(format!("rtpr_{}_rejected_packets", source))
            .increment(report.rejected_packets as u64);
        metrics::histogram!(format!("rtpr_{}_duration_ms", source)).record(report.duration as f64);
        if let Some(r_factor) = report.r_factor {
            metrics::histogram!(format!("rtpr_{}_r_factor", source)).record(r_factor);
        }
        if let Some(mos) = report.mos {
            metrics::histogram!(format!("rtpr_{}_mos", source)).record(mos);
        }
    }
}

pub mod bus {
    /// Incremented whenever a bounded topic queue rejects a message.
    pub fn dropped(topic: &str) {
        metrics::counter!(
            "bus_dropped_messages",
            "topic" => topic.to_string()
        )
        .increment(1);
    }
}

pub mod ingest {
    pub fn packets_processed(protocol: &str) {
        metrics::counter!(
            "packets_processed",
            "protocol" => protocol.to_string()
        )
        .increment(1);
    }

    pub fn packets_dropped(reason: &str) {
        metrics::counter!(
            "packets_dropped",
            "reason" => reason.to_string()
        )
        .increment(1);
    }
}

pub fn init_static_gauges() {
    let version = crate::version::get_short_version();
    metrics::gauge!("voipmon_info", "version" => version).set(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtpr::{ReportSource, RtpReportPayload};

    /// The macros only record once a recorder is installed; this verifies the
    /// emitters compile and accept the dynamic names.
    #[test]
    fn test_metric_emitters_compile() {
        sip::message("INVITE", Some("INVITE"), None, Some("pbx-a"), None);
        sip::message("INVITE", None, Some(200), None, Some("pbx-b"));
        sip::message("OPTIONS", Some("OPTIONS"), None, None, None);

        let report = RtpReportPayload::new(ReportSource::Rtp, 0x1234);
        rtpr::report("rtp", &report);
        rtpr::report("rtcp", &report);

        bus::dropped("sip");
        ingest::packets_processed("sip");
        ingest::packets_dropped("malformed");
    }
}
