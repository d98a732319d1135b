//! Job CLI subcommands.
//!
//! Provides commands to:
//! - `add` / `edit`: Define a one-time or recurring capture window,
//!   optionally starting from a template
//! - `list` / `show`: Inspect jobs and their recorded instances
//! - `remove`: Delete a job and its instances
//! - `pause` / `resume`: Keep a job but stop or restart triggering it

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, NaiveTime};
use clap::{Args, Subcommand};

use crate::core::{next_occurrence, Control};
use crate::domain::{JobDefinition, JobId, RecurrencePattern, Template, WeekdaySet};

/// Job-related subcommands
#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// Define a new capture job
    Add(JobArgs),

    /// Replace an existing job's definition
    Edit {
        /// Job ID (or unique prefix)
        job_id: String,

        #[command(flatten)]
        args: JobArgs,
    },

    /// List all jobs
    List,

    /// Show a job and its recorded instances
    Show {
        /// Job ID (or unique prefix)
        job_id: String,
    },

    /// Delete a job and everything recorded for it
    Remove {
        /// Job ID (or unique prefix)
        job_id: String,
    },

    /// Stop triggering a job without deleting it
    Pause {
        /// Job ID (or unique prefix)
        job_id: String,
    },

    /// Resume triggering a paused job
    Resume {
        /// Job ID (or unique prefix)
        job_id: String,
    },
}

/// Fields of a job definition
#[derive(Args, Debug)]
pub struct JobArgs {
    /// Display name, also used in output filenames
    pub name: String,

    /// First start, local time ("2026-10-05 09:00")
    #[arg(short, long)]
    pub start: String,

    /// Capture length ("90m", "1h30m", "5400")
    #[arg(short, long, required_unless_present = "template")]
    pub duration: Option<String>,

    /// Start from a template's length, schedule and video flag; other
    /// options given here override it
    #[arg(short, long)]
    pub template: Option<String>,

    /// Repeat every day at the start time
    #[arg(long, conflicts_with_all = ["weekly", "monthly"])]
    pub daily: bool,

    /// Repeat on these weekdays (comma-separated, e.g. mon,wed,fri)
    #[arg(long, value_delimiter = ',', conflicts_with = "monthly")]
    pub weekly: Option<Vec<String>>,

    /// Repeat on this day of the month (months without it are skipped)
    #[arg(long)]
    pub monthly: Option<u32>,

    /// Also record the camera stream
    #[arg(long)]
    pub video: bool,

    /// Allow durations beyond the standard limit
    #[arg(long)]
    pub allow_override: bool,

    #[arg(long, default_value = "")]
    pub notes: String,
}

impl JobArgs {
    pub fn into_definition(self, template: Option<&Template>) -> Result<JobDefinition> {
        let start = parse_start(&self.start)?;
        let time_of_day: NaiveTime = start.time();

        let recurrence = if self.daily {
            Some(RecurrencePattern::daily(time_of_day))
        } else if let Some(days) = self.weekly {
            let set = WeekdaySet::try_from(days).map_err(|e| anyhow::anyhow!(e))?;
            Some(RecurrencePattern::weekly(set, time_of_day))
        } else {
            self.monthly
                .map(|day| RecurrencePattern::monthly(day, time_of_day))
        };
        let duration_secs = self.duration.as_deref().map(parse_duration).transpose()?;

        let mut def = match template {
            Some(template) => template.job_definition(self.name, start),
            None => JobDefinition {
                name: self.name,
                start,
                duration_secs: duration_secs.context("A duration is required without --template")?,
                recurrence: None,
                capture_video: false,
                allow_override: false,
                notes: String::new(),
            },
        };
        if let Some(secs) = duration_secs {
            def.duration_secs = secs;
        }
        if recurrence.is_some() {
            def.recurrence = recurrence;
        }
        def.capture_video |= self.video;
        def.allow_override = self.allow_override;
        if !self.notes.is_empty() {
            def.notes = self.notes;
        }
        Ok(def)
    }

    fn template(&self, control: &Control) -> Result<Option<Template>> {
        self.template
            .as_deref()
            .map(|name| control.get_template(name))
            .transpose()
    }
}

/// Execute job subcommands
pub async fn execute(control: &Control, command: JobCommands) -> Result<()> {
    match command {
        JobCommands::Add(args) => {
            let template = args.template(control)?;
            let id = control.create_job(args.into_definition(template.as_ref())?)?;
            let job = control.get_job(id)?;
            println!("Created job {}", id);
            println!("  {}", job.schedule_summary());
        }
        JobCommands::Edit { job_id, args } => {
            let id = resolve_job_id(control, &job_id)?;
            let template = args.template(control)?;
            control.update_job(id, args.into_definition(template.as_ref())?)?;
            println!("Updated job {}", id);
        }
        JobCommands::List => list_jobs(control)?,
        JobCommands::Show { job_id } => {
            let id = resolve_job_id(control, &job_id)?;
            show_job(control, id)?;
        }
        JobCommands::Remove { job_id } => {
            let id = resolve_job_id(control, &job_id)?;
            control.delete_job(id)?;
            println!("Removed job {}", id);
        }
        JobCommands::Pause { job_id } => {
            let id = resolve_job_id(control, &job_id)?;
            control.pause_job(id)?;
            println!("Paused job {}", id);
        }
        JobCommands::Resume { job_id } => {
            let id = resolve_job_id(control, &job_id)?;
            control.resume_job(id)?;
            println!("Resumed job {}", id);
        }
    }
    Ok(())
}

fn list_jobs(control: &Control) -> Result<()> {
    let jobs = control.list_jobs()?;
    if jobs.is_empty() {
        println!("No jobs defined");
        return Ok(());
    }

    println!(
        "{:<10} {:<24} {:<10} {:<8} {}",
        "ID", "NAME", "STATUS", "LENGTH", "SCHEDULE"
    );
    println!("{}", "-".repeat(90));
    for job in jobs {
        let id = job.id.to_string();
        println!(
            "{:<10} {:<24} {:<10} {:<8} {}{}",
            &id[..8],
            truncate(&job.name, 24),
            job.status,
            format_duration(job.duration_secs),
            job.schedule_summary(),
            if job.capture_video { " +video" } else { "" }
        );
    }
    Ok(())
}

fn show_job(control: &Control, id: JobId) -> Result<()> {
    let job = control.get_job(id)?;
    println!("Job ID:   {}", job.id);
    println!("Name:     {}", job.name);
    println!("Status:   {}", job.status);
    println!("Schedule: {}", job.schedule_summary());
    println!("Length:   {}", format_duration(job.duration_secs));
    println!("Video:    {}", if job.capture_video { "yes" } else { "no" });
    if job.allow_override {
        println!("Override: duration limit lifted");
    }
    if !job.notes.is_empty() {
        println!("Notes:    {}", job.notes);
    }
    if let Some(pattern) = &job.recurrence {
        let now = chrono::Local::now().naive_local();
        if let Some(next) = next_occurrence(pattern, now.max(job.start - chrono::Duration::seconds(1))) {
            println!("Next:     {}", next.format("%Y-%m-%d %H:%M"));
        }
    }

    let instances = control.recorder().ledger.instances_for_job(id)?;
    println!("\nInstances:");
    if instances.is_empty() {
        println!("  (none recorded)");
    }
    for instance in instances {
        println!(
            "  {}  {:<10} {:<9} {}",
            instance.occurrence_date,
            instance.status,
            instance.provenance.as_str(),
            instance.notes
        );
    }
    Ok(())
}

/// Accept a full UUID or a prefix matching exactly one job
pub fn resolve_job_id(control: &Control, text: &str) -> Result<JobId> {
    if let Ok(id) = text.parse::<JobId>() {
        return Ok(id);
    }
    let matches: Vec<JobId> = control
        .list_jobs()?
        .into_iter()
        .map(|job| job.id)
        .filter(|id| id.to_string().starts_with(text))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => anyhow::bail!("No job matches '{}'", text),
        _ => anyhow::bail!("'{}' matches {} jobs; use more characters", text, matches.len()),
    }
}

/// Local start time in a few common layouts
pub fn parse_start(text: &str) -> Result<NaiveDateTime> {
    const LAYOUTS: [&str; 4] = [
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
    ];
    LAYOUTS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(text.trim(), layout).ok())
        .with_context(|| format!("Invalid start time '{}', expected YYYY-MM-DD HH:MM", text))
}

/// Seconds from "5400", "90m", "1h30m" or "45s"
pub fn parse_duration(text: &str) -> Result<u64> {
    let text = text.trim();
    if text.is_empty() {
        anyhow::bail!("Duration is empty");
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(secs);
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => anyhow::bail!("Invalid duration '{}': unknown unit '{}'", text, c),
        };
        let value: u64 = digits
            .parse()
            .with_context(|| format!("Invalid duration '{}'", text))?;
        total += value * unit;
        digits.clear();
    }
    if !digits.is_empty() {
        anyhow::bail!("Invalid duration '{}': trailing number without unit", text);
    }
    Ok(total)
}

pub fn format_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (h, m, s) {
        (0, 0, s) => format!("{}s", s),
        (0, m, 0) => format!("{}m", m),
        (h, 0, 0) => format!("{}h", h),
        (h, m, 0) => format!("{}h{}m", h, m),
        (0, m, s) => format!("{}m{}s", m, s),
        (h, m, s) => format!("{}h{}m{}s", h, m, s),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let kept: String = text.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}
