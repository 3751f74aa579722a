// src/fetch/urls.rs
use anyhow::{Context, Result};
use url::Url;

use crate::config::ArchiveTemplate;

/// Archive names to try for `year`, in template order, without duplicates.
pub fn candidate_names(templates: &[ArchiveTemplate], year: u16) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for template in templates.iter().filter(|t| t.applies(year)) {
        let name = template.render(year);
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// `base` with `{yyyy}` substituted, joined with the archive name.
pub fn archive_url(base: &str, year: u16, name: &str) -> Result<Url> {
    let mut dir = base.replace("{yyyy}", &format!("{year:04}"));
    if !dir.ends_with('/') {
        dir.push('/');
    }
    let base = Url::parse(&dir).with_context(|| format!("invalid base url {dir}"))?;
    base.join(name)
        .with_context(|| format!("cannot join {name} onto {base}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    #[test]
    fn naming_convention_changes_across_decades() {
        let templates = PipelineConfig::default().archive_templates;
        assert_eq!(
            candidate_names(&templates, 1990),
            vec!["CDBRFS90XPT.ZIP", "cdbrfs90xpt.zip"]
        );
        assert_eq!(
            candidate_names(&templates, 2005),
            vec!["CDBRFS05XPT.ZIP", "CDBRFS2005XPT.ZIP", "cdbrfs05xpt.zip"]
        );
    }

    #[test]
    fn urls_substitute_the_year_directory() {
        let url = archive_url(
            "https://www.cdc.gov/brfss/annual_data/{yyyy}/files",
            1995,
            "CDBRFS95XPT.ZIP",
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://www.cdc.gov/brfss/annual_data/1995/files/CDBRFS95XPT.ZIP"
        );
    }
}
