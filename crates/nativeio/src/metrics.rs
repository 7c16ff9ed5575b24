//! Native I/O metrics.
//!
//! The constants defined in this module are the names of metrics that the
//! streams maintain via [`metrics`] crate interfaces.
use ::metrics::{describe_counter, describe_histogram, Unit};

/// Total number of files opened for direct reads.
pub const DIRECT_READS_OPENED: &str = "nativeio.direct_reads_opened";

/// Total number of files opened for direct writes.
pub const DIRECT_WRITES_OPENED: &str = "nativeio.direct_writes_opened";

/// Total number of buffer refills by direct inputs.
pub const DIRECT_REFILLS: &str = "nativeio.direct_refills";

/// Total number of bytes read from disk by direct inputs.
pub const DIRECT_BYTES_READ: &str = "nativeio.direct_bytes_read";

/// Total number of buffer flushes by direct outputs.
pub const DIRECT_FLUSHES: &str = "nativeio.direct_flushes";

/// Total number of bytes written to disk by direct outputs, padding included.
pub const DIRECT_BYTES_WRITTEN: &str = "nativeio.direct_bytes_written";

/// Histogram of direct flush latency.
pub const DIRECT_FLUSH_LATENCY: &str = "nativeio.direct_flush_latency";

/// Total number of files mapped into memory.
pub const REGIONS_MAPPED: &str = "nativeio.regions_mapped";

/// Total number of mappings torn down.
pub const REGIONS_UNMAPPED: &str = "nativeio.regions_unmapped";

/// Total number of bytes eagerly preloaded into mappings.
pub const BYTES_PRELOADED: &str = "nativeio.bytes_preloaded";

/// Adds descriptions for the metrics we expose.
pub(crate) fn describe_metrics() {
    describe_counter!(DIRECT_READS_OPENED, "total number of direct inputs opened");
    describe_counter!(DIRECT_WRITES_OPENED, "total number of direct outputs opened");
    describe_counter!(DIRECT_REFILLS, "total number of direct buffer refills");
    describe_counter!(
        DIRECT_BYTES_READ,
        Unit::Bytes,
        "total number of bytes read with direct I/O"
    );
    describe_counter!(DIRECT_FLUSHES, "total number of direct buffer flushes");
    describe_counter!(
        DIRECT_BYTES_WRITTEN,
        Unit::Bytes,
        "total number of bytes written with direct I/O"
    );
    describe_histogram!(
        DIRECT_FLUSH_LATENCY,
        Unit::Seconds,
        "Direct buffer flush latency"
    );

    describe_counter!(REGIONS_MAPPED, "total number of files mapped");
    describe_counter!(REGIONS_UNMAPPED, "total number of mappings released");
    describe_counter!(
        BYTES_PRELOADED,
        Unit::Bytes,
        "total number of mapped bytes preloaded"
    );
}
