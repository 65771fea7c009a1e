// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Criterion benchmarks for print-subsystem output parsing and payload
// hashing in the edgeprint-print crate.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use edgeprint_print::backend::cups::{parse_lpq, parse_lpstat_printers};
use edgeprint_print::capabilities::parse_lpoptions;
use edgeprint_print::payload::sha256_hex;

const LPOPTIONS_LISTING: &str = "\
PageSize/Media Size: Letter *A4 A5 Legal Executive Env10 EnvDL
Duplex/Two-Sided: None *DuplexNoTumble DuplexTumble
ColorModel/Color Mode: Gray *RGB
MediaType/Media Type: *Plain Glossy Transparency Labels Envelope
Resolution/Resolution: 300dpi *600dpi 1200dpi
InputSlot/Paper Source: *Auto Tray1 Tray2 Manual
";

const LPSTAT_LISTING: &str = "\
printer Office_Laser is idle.  enabled since Mon 12 Oct 2026 09:14:02
printer Lab_Color now printing Lab_Color-88.  enabled since Mon 12 Oct 2026 09:20:11
printer Old_Inkjet disabled since Fri 09 Oct 2026 17:02:45 -
\tPaused
";

/// `lpq` output with `n` queued rows behind one active job.
fn lpq_listing(n: usize) -> String {
    let mut out = String::from(
        "Office_Laser is ready and printing\nRank    Owner   Job     File(s)                         Total Size\n",
    );
    out.push_str("active  edge    100     report.pdf                      48213 bytes\n");
    for i in 0..n {
        out.push_str(&format!(
            "{}st     edge    {}     doc-{i}.pdf                       1024 bytes\n",
            i + 1,
            101 + i
        ));
    }
    out
}

fn bench_parse_lpoptions(c: &mut Criterion) {
    c.bench_function("parse_lpoptions (generic driver)", |b| {
        b.iter(|| parse_lpoptions(black_box("Office_Laser"), black_box(LPOPTIONS_LISTING)))
    });
}

fn bench_parse_queue_listings(c: &mut Criterion) {
    let short = lpq_listing(3);
    let long = lpq_listing(200);

    c.bench_function("parse_lpq (4 jobs)", |b| b.iter(|| parse_lpq(black_box(&short))));
    c.bench_function("parse_lpq (201 jobs)", |b| b.iter(|| parse_lpq(black_box(&long))));
    c.bench_function("parse_lpstat_printers", |b| {
        b.iter(|| parse_lpstat_printers(black_box(LPSTAT_LISTING)))
    });
}

fn bench_payload_hash(c: &mut Criterion) {
    let payload = vec![0xA5u8; 1024 * 1024];
    c.bench_function("sha256_hex (1 MiB payload)", |b| {
        b.iter(|| sha256_hex(black_box(&payload)))
    });
}

criterion_group!(
    benches,
    bench_parse_lpoptions,
    bench_parse_queue_listings,
    bench_payload_hash
);
criterion_main!(benches);
