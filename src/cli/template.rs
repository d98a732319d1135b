//! Template CLI subcommands.
//!
//! Templates are named presets (length, schedule, video) that
//! `job add --template <name>` starts from.

use anyhow::{Context, Result};
use chrono::NaiveTime;
use clap::{Args, Subcommand};

use super::job::{format_duration, parse_duration};
use crate::core::Control;
use crate::domain::{RecurrencePattern, TemplateDefinition, WeekdaySet};

/// Template-related subcommands
#[derive(Subcommand, Debug)]
pub enum TemplateCommands {
    /// Save a new template
    Add {
        /// Unique template name
        name: String,

        #[command(flatten)]
        args: TemplateArgs,
    },

    /// List all templates
    List,

    /// Show one template
    Show { name: String },

    /// Replace a template's fields
    Edit {
        name: String,

        /// New name for the template
        #[arg(long)]
        rename: Option<String>,

        #[command(flatten)]
        args: TemplateArgs,
    },

    /// Delete a template; jobs made from it are kept
    Remove { name: String },
}

/// Fields of a template
#[derive(Args, Debug)]
pub struct TemplateArgs {
    /// Capture length ("90m", "1h30m", "5400")
    #[arg(short, long)]
    pub duration: String,

    /// Repeat every day
    #[arg(long, requires = "at", conflicts_with_all = ["weekly", "monthly"])]
    pub daily: bool,

    /// Repeat on these weekdays (comma-separated, e.g. mon,wed,fri)
    #[arg(long, requires = "at", value_delimiter = ',', conflicts_with = "monthly")]
    pub weekly: Option<Vec<String>>,

    /// Repeat on this day of the month
    #[arg(long, requires = "at")]
    pub monthly: Option<u32>,

    /// Time of day for repeating templates ("19:00")
    #[arg(long)]
    pub at: Option<String>,

    /// Also record the camera stream
    #[arg(long)]
    pub video: bool,

    #[arg(long, default_value = "")]
    pub description: String,
}

impl TemplateArgs {
    pub fn into_definition(self, name: String) -> Result<TemplateDefinition> {
        let duration_secs = parse_duration(&self.duration)?;
        let time_of_day = self
            .at
            .as_deref()
            .map(|text| {
                NaiveTime::parse_from_str(text.trim(), "%H:%M")
                    .with_context(|| format!("Invalid time '{}', expected HH:MM", text))
            })
            .transpose()?;

        let recurrence = match time_of_day {
            None => None,
            Some(time) if self.daily => Some(RecurrencePattern::daily(time)),
            Some(time) => match (self.weekly, self.monthly) {
                (Some(days), _) => {
                    let set = WeekdaySet::try_from(days).map_err(|e| anyhow::anyhow!(e))?;
                    Some(RecurrencePattern::weekly(set, time))
                }
                (None, Some(day)) => Some(RecurrencePattern::monthly(day, time)),
                (None, None) => anyhow::bail!("--at needs --daily, --weekly or --monthly"),
            },
        };

        Ok(TemplateDefinition {
            name,
            duration_secs,
            recurrence,
            capture_video: self.video,
            description: self.description,
        })
    }
}

/// Execute template subcommands
pub fn execute(control: &Control, command: TemplateCommands) -> Result<()> {
    match command {
        TemplateCommands::Add { name, args } => {
            let template = control.create_template(args.into_definition(name)?)?;
            println!("Created template {}", template.summary());
        }
        TemplateCommands::List => {
            let templates = control.list_templates()?;
            if templates.is_empty() {
                println!("No templates defined");
            }
            for template in templates {
                println!("{}", template.summary());
            }
        }
        TemplateCommands::Show { name } => {
            let template = control.get_template(&name)?;
            println!("Name:     {}", template.name);
            println!("Length:   {}", format_duration(template.duration_secs));
            match &template.recurrence {
                Some(pattern) => println!("Schedule: {}", pattern),
                None => println!("Schedule: one-time"),
            }
            println!("Video:    {}", if template.capture_video { "yes" } else { "no" });
            if !template.description.is_empty() {
                println!("About:    {}", template.description);
            }
            println!("Updated:  {}", template.updated_at.format("%Y-%m-%d %H:%M UTC"));
        }
        TemplateCommands::Edit { name, rename, args } => {
            let definition = args.into_definition(rename.unwrap_or_else(|| name.clone()))?;
            let template = control.update_template(&name, definition)?;
            println!("Updated template {}", template.summary());
        }
        TemplateCommands::Remove { name } => {
            control.delete_template(&name)?;
            println!("Removed template {}", name);
        }
    }
    Ok(())
}
