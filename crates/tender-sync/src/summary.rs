use std::fmt::Write as _;

use tender_core::RunMetadata;

/// Human summary printed after every run.
pub fn render_run_summary(metadata: &RunMetadata, metadata_locations: &[String]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "run {} finished", metadata.run_id);
    let _ = writeln!(
        out,
        "  duration:       {:.1}s",
        metadata.duration_seconds.unwrap_or_default()
    );
    let _ = writeln!(out, "  pages visited:  {}", metadata.pages_visited);
    let _ = writeln!(out, "  tenders parsed: {}", metadata.tenders_parsed);
    let _ = writeln!(out, "  tenders saved:  {}", metadata.tenders_saved);
    let _ = writeln!(out, "  deduplicated:   {}", metadata.deduped_count);
    let _ = writeln!(out, "  failures:       {}", metadata.failures);

    if !metadata.tender_types_processed.is_empty() {
        let types = metadata
            .tender_types_processed
            .iter()
            .map(|(kind, n)| format!("{kind}={n}"))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "  tender types:   {types}");
    }
    for (kind, entries) in &metadata.error_summary {
        let _ = writeln!(out, "  {kind}: {}", entries.len());
        if let Some(first) = entries.first() {
            let _ = writeln!(out, "    first: {}", first.message);
        }
    }
    if let Some(output) = &metadata.output_file {
        let _ = writeln!(out, "  output:         {output}");
    }
    for location in metadata_locations {
        let _ = writeln!(out, "  metadata:       {location}");
    }
    out
}

/// One line per stored run, newest first.
pub fn render_run_list(runs: &[RunMetadata]) -> String {
    if runs.is_empty() {
        return "no runs recorded\n".to_string();
    }
    runs.iter()
        .map(|run| {
            format!(
                "{}  {}  parsed={} saved={} deduped={} failures={}\n",
                run.run_id,
                run.start_time.format("%Y-%m-%d %H:%M:%S"),
                run.tenders_parsed,
                run.tenders_saved,
                run.deduped_count,
                run.failures
            )
        })
        .collect()
}
