use console::Style;
use subphot_core::config::ResolvedConfig;
use subphot_core::frame::Scope;
use subphot_core::invalidate::InvalidationReport;
use subphot_core::pipeline::{BatchReport, Stage};
use subphot_core::reference::ReferenceFrame;
use subphot_core::registry::Orphan;

struct Styles {
    title: Style,
    label: Style,
    value: Style,
    ok: Style,
    warn: Style,
    disabled: Style,
    path: Style,
}

impl Styles {
    fn new() -> Self {
        Self {
            title: Style::new().cyan().bold(),
            label: Style::new().dim(),
            value: Style::new().bold().white(),
            ok: Style::new().green(),
            warn: Style::new().yellow().bold(),
            disabled: Style::new().dim().yellow(),
            path: Style::new().underlined(),
        }
    }
}

fn title(s: &Styles, text: &str) {
    println!();
    println!("  {}", s.title.apply_to(text));
    println!("  {}", s.title.apply_to("\u{2550}".repeat(text.chars().count())));
    println!();
}

pub fn print_run_summary(config: &ResolvedConfig) {
    let s = Styles::new();
    title(&s, "Subphot Run");

    println!("  {:<14}{}", s.label.apply_to("Scope"), s.value.apply_to(config.scope));
    println!(
        "  {:<14}{} (scid {})",
        s.label.apply_to("Mode"),
        s.value.apply_to(config.mode),
        config.scid
    );
    println!("  {:<14}{}", s.label.apply_to("Input"), s.path.apply_to(&config.input_glob));
    println!(
        "  {:<14}{}",
        s.label.apply_to("Work dir"),
        s.path.apply_to(config.work_dir.display())
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("Registry"),
        s.path.apply_to(config.layout.database.display())
    );
    let workers = match config.sample {
        Some(sample) => format!("{} (sample of {sample} frames)", config.workers),
        None => config.workers.to_string(),
    };
    println!("  {:<14}{}", s.label.apply_to("Workers"), s.value.apply_to(workers));
    println!("  {:<14}{}", s.label.apply_to("Kernel"), s.ok.apply_to(&config.kernel));
    println!(
        "  {:<14}{}",
        s.label.apply_to("Apertures"),
        s.ok.apply_to(config.apertures_string())
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("Subtraction"),
        s.ok.apply_to(config.subtraction_method())
    );
    let stages: Vec<&str> = config.graph().sequence().iter().map(Stage::as_str).collect();
    println!("  {:<14}{}", s.label.apply_to("Stages"), stages.join(" \u{2192} "));
    if config.toggles.is_empty() {
        println!("  {:<14}{}", s.label.apply_to("Toggles"), s.disabled.apply_to("none"));
    } else {
        println!("  {:<14}{}", s.label.apply_to("Toggles"), config.toggles);
    }
    println!();
}

pub fn print_missing_templates(stages: &[Stage]) {
    let s = Styles::new();
    let names: Vec<&str> = stages.iter().map(Stage::as_str).collect();
    println!(
        "  {} no command template for: {}",
        s.warn.apply_to("warning:"),
        names.join(", ")
    );
}

pub fn print_batch_report(report: &BatchReport) {
    let s = Styles::new();
    title(&s, "Batch Report");

    println!("  {:<14}{}", s.label.apply_to("Dispatched"), s.value.apply_to(report.dispatched));
    println!("  {:<14}{}", s.label.apply_to("Completed"), s.ok.apply_to(report.completed));
    println!("  {:<14}{}", s.label.apply_to("Already done"), report.already_done);
    println!("  {:<14}{}", s.label.apply_to("Passes"), report.passes);

    if report.failed.is_empty() {
        println!("  {:<14}{}", s.label.apply_to("Failed"), s.ok.apply_to(0));
    } else {
        println!(
            "  {:<14}{}",
            s.label.apply_to("Failed"),
            s.warn.apply_to(report.failed.len())
        );
        for (frame, stage, message) in &report.failed {
            println!("    {} {:<11} {}", frame, stage, s.label.apply_to(message));
        }
    }
    for (stage, reason) in &report.blocked {
        println!(
            "  {} {} blocked: {}",
            s.warn.apply_to("warning:"),
            stage,
            reason
        );
    }
    if !report.is_clean() {
        println!();
        println!("  Failed and blocked frames stay pending; rerun to retry them.");
    }
    println!();
}

pub fn print_status(
    scope: &Scope,
    frames: usize,
    counts: &[(Stage, usize)],
    references: &[ReferenceFrame],
) {
    let s = Styles::new();
    title(&s, "Registry Status");

    println!("  {:<14}{}", s.label.apply_to("Scope"), s.value.apply_to(scope));
    println!("  {:<14}{}", s.label.apply_to("Frames"), s.value.apply_to(frames));
    for (stage, count) in counts {
        let style = if *count == frames && frames > 0 { &s.ok } else { &s.value };
        println!("  {:<14}{}", s.label.apply_to(stage), style.apply_to(count));
    }
    println!();
    if references.is_empty() {
        println!("  {:<14}{}", s.label.apply_to("References"), s.disabled.apply_to("none"));
    }
    for reference in references {
        print_reference(&s, reference);
    }
    println!();
}

pub fn print_references(references: &[ReferenceFrame]) {
    let s = Styles::new();
    title(&s, "Reference Frames");
    if references.is_empty() {
        println!("  {}", s.disabled.apply_to("none installed"));
    }
    for reference in references {
        print_reference(&s, reference);
    }
    println!();
}

fn print_reference(s: &Styles, reference: &ReferenceFrame) {
    let state = if reference.is_current {
        s.ok.apply_to("current".to_string())
    } else {
        let when = reference
            .superseded_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        s.disabled.apply_to(format!("superseded {when}"))
    };
    println!(
        "  {:<14}#{} {} {}",
        s.label.apply_to(reference.kind),
        reference.id,
        s.path.apply_to(reference.path.display()),
        state
    );
}

pub fn print_orphans(scope: &Scope, orphans: &[Orphan]) {
    let s = Styles::new();
    title(&s, "Lineage Check");
    println!("  {:<14}{}", s.label.apply_to("Scope"), s.value.apply_to(scope));
    if orphans.is_empty() {
        println!("  {}", s.ok.apply_to("Every stage record has its upstream record"));
    }
    for orphan in orphans {
        println!(
            "  {} {} #{} of {} (missing {})",
            s.warn.apply_to("orphan:"),
            orphan.stage,
            orphan.record_id,
            orphan.origin,
            orphan.missing
        );
    }
    println!();
}

pub fn print_invalidation(scope: &Scope, report: &InvalidationReport) {
    let s = Styles::new();
    title(&s, "Invalidation");
    println!("  {:<14}{}", s.label.apply_to("Scope"), s.value.apply_to(scope));
    println!("  {:<14}{}", s.label.apply_to("Files"), s.value.apply_to(report.files_removed));
    if report.files_missing > 0 {
        println!("  {:<14}{}", s.label.apply_to("Absent"), report.files_missing);
    }
    if report.files_failed > 0 {
        println!(
            "  {:<14}{}",
            s.label.apply_to("Not removed"),
            s.warn.apply_to(report.files_failed)
        );
    }
    for (stage, rows) in &report.purged {
        println!("  {:<14}{} row(s)", s.label.apply_to(stage), rows);
    }
    if report.frame_info_purged > 0 {
        println!("  {:<14}{} row(s)", s.label.apply_to("frame info"), report.frame_info_purged);
    }
    if report.references_cleared > 0 {
        println!(
            "  {:<14}{} row(s)",
            s.label.apply_to("references"),
            report.references_cleared
        );
    }
    println!();
}
