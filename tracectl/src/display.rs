// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::control::{TargetEntry, TargetTable};
use std::fmt::Display;

macro_rules! TARGET_FMT {
    () => {
        "{:>40} │ {:>8} │ {:>6} │ {}"
    };
}

impl Display for TargetEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(
            f,
            "{}",
            format_args!(
                TARGET_FMT!(),
                self.target,
                self.level,
                self.kind.as_str(),
                self.tags.join(",")
            )
        )
    }
}

impl Display for TargetTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f)?;
        writeln!(f, "{:>30}──────── Tracing targets ────────", "")?;
        writeln!(
            f,
            "{}",
            format_args!(TARGET_FMT!(), "TARGET", "LEVEL", "KIND", "TAGS")
        )?;
        for entry in self.targets.values() {
            writeln!(f, "{entry}")?;
        }
        write!(
            f,
            "{}",
            format_args!(TARGET_FMT!(), "(default)", self.level, "--", "--")
        )
    }
}

pub(crate) struct TargetTableByTag<'a>(pub(crate) &'a TargetTable);
impl Display for TargetTableByTag<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.0;
        writeln!(f)?;
        writeln!(f, "{:>30}──────── Tracing targets by tag ────────", "")?;
        for tag in table.tags.values() {
            writeln!(f, " {}:", tag.tag)?;
            for target in table
                .targets
                .values()
                .filter(|t| tag.targets.contains(t.target))
            {
                write!(f, "      {:<40} : {}", target.target, target.level)?;
                let others: Vec<_> = target.tags.iter().filter(|t| **t != tag.tag).collect();
                if !others.is_empty() {
                    write!(f, " (also:")?;
                    for other in others {
                        write!(f, " {other}")?;
                    }
                    write!(f, ")")?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::control::get_trace_ctl;
    use crate::{LevelFilter, custom_target};

    #[test]
    fn target_line_shows_kind_and_tags() {
        custom_target!("display-check", LevelFilter::DEBUG, &["display"]);
        let entry = get_trace_ctl()
            .entry("display-check")
            .expect("Should succeed");
        let line = entry.to_string();
        assert!(line.contains("display-check"));
        assert!(line.contains("custom"));
        assert!(line.contains("display"));
    }
}
