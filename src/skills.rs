use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

const MAX_CATALOG_ITEMS: usize = 40;
const MAX_DESCRIPTION_CHARS: usize = 120;

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Always-skills are inlined verbatim into every system prompt;
    /// everything else is disclosed through the catalog.
    pub always: bool,
    pub body: String,
}

#[derive(Debug, Deserialize, Default)]
struct SkillFrontmatter {
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    always: bool,
}

/// Discovers `<skills_dir>/<skill>/SKILL.md` files with YAML frontmatter.
pub struct SkillManager {
    skills_dir: PathBuf,
}

impl SkillManager {
    pub fn new(skills_dir: &str) -> Self {
        SkillManager {
            skills_dir: PathBuf::from(skills_dir),
        }
    }

    pub fn discover(&self) -> Vec<Skill> {
        let mut skills = Vec::new();
        let entries = match std::fs::read_dir(&self.skills_dir) {
            Ok(entries) => entries,
            Err(_) => return skills,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let skill_file = path.join("SKILL.md");
            let Ok(raw) = std::fs::read_to_string(&skill_file) else {
                continue;
            };
            match parse_skill(&raw, &path) {
                Some(skill) => skills.push(skill),
                None => warn!("skipping malformed skill at {}", skill_file.display()),
            }
        }

        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    pub fn always_skills(&self) -> Vec<Skill> {
        self.discover().into_iter().filter(|s| s.always).collect()
    }

    /// Bounded one-line-per-skill catalog for progressive disclosure.
    pub fn build_catalog(&self) -> String {
        let mut out = String::new();
        for skill in self
            .discover()
            .iter()
            .filter(|s| !s.always)
            .take(MAX_CATALOG_ITEMS)
        {
            let description: String = skill
                .description
                .chars()
                .take(MAX_DESCRIPTION_CHARS)
                .collect();
            out.push_str(&format!("- {}: {}\n", skill.name, description));
        }
        out
    }
}

fn parse_skill(raw: &str, dir: &Path) -> Option<Skill> {
    let fallback_name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let (front, body) = split_frontmatter(raw);
    let meta: SkillFrontmatter = match front {
        Some(front) => serde_yaml::from_str(front).ok()?,
        None => SkillFrontmatter::default(),
    };

    let name = meta
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(fallback_name);
    if name.trim().is_empty() {
        return None;
    }

    Some(Skill {
        name,
        description: meta.description,
        always: meta.always,
        body: body.trim().to_string(),
    })
}

/// Split a `---` fenced YAML frontmatter block off the top of a file.
fn split_frontmatter(raw: &str) -> (Option<&str>, &str) {
    let trimmed = raw.trim_start();
    let Some(rest) = trimmed.strip_prefix("---") else {
        return (None, raw);
    };
    match rest.find("\n---") {
        Some(end) => {
            let front = &rest[..end];
            // skip past the closing fence line
            let after = &rest[end + 1..];
            let body = after.split_once('\n').map(|(_, b)| b).unwrap_or("");
            (Some(front), body)
        }
        None => (None, raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skills_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("wisp_skills_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_skill(dir: &Path, folder: &str, content: &str) {
        let skill_dir = dir.join(folder);
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(skill_dir.join("SKILL.md"), content).unwrap();
    }

    fn cleanup(dir: &Path) {
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_discover_parses_frontmatter() {
        let dir = skills_dir();
        write_skill(
            &dir,
            "weather",
            "---\nname: weather\ndescription: Check the weather\n---\nUse web_fetch on wttr.in.",
        );

        let manager = SkillManager::new(dir.to_str().unwrap());
        let skills = manager.discover();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "weather");
        assert_eq!(skills[0].description, "Check the weather");
        assert!(!skills[0].always);
        assert!(skills[0].body.contains("wttr.in"));
        cleanup(&dir);
    }

    #[test]
    fn test_missing_name_falls_back_to_directory() {
        let dir = skills_dir();
        write_skill(&dir, "notes", "---\ndescription: Take notes\n---\nBody.");
        let manager = SkillManager::new(dir.to_str().unwrap());
        let skills = manager.discover();
        assert_eq!(skills[0].name, "notes");
        cleanup(&dir);
    }

    #[test]
    fn test_always_skills_partition() {
        let dir = skills_dir();
        write_skill(
            &dir,
            "core",
            "---\nname: core\ndescription: Core rules\nalways: true\n---\nAlways be brief.",
        );
        write_skill(
            &dir,
            "extra",
            "---\nname: extra\ndescription: Extra powers\n---\nLong body.",
        );

        let manager = SkillManager::new(dir.to_str().unwrap());
        let always = manager.always_skills();
        assert_eq!(always.len(), 1);
        assert_eq!(always[0].name, "core");

        let catalog = manager.build_catalog();
        assert!(catalog.contains("- extra: Extra powers"));
        assert!(!catalog.contains("core"));
        cleanup(&dir);
    }

    #[test]
    fn test_catalog_truncates_descriptions() {
        let dir = skills_dir();
        let long_desc = "d".repeat(300);
        write_skill(
            &dir,
            "verbose",
            &format!("---\nname: verbose\ndescription: {long_desc}\n---\nBody."),
        );
        let manager = SkillManager::new(dir.to_str().unwrap());
        let catalog = manager.build_catalog();
        let line = catalog.lines().next().unwrap();
        assert!(line.len() < 140);
        cleanup(&dir);
    }

    #[test]
    fn test_empty_dir_is_fine() {
        let dir = skills_dir();
        let manager = SkillManager::new(dir.to_str().unwrap());
        assert!(manager.discover().is_empty());
        assert!(manager.build_catalog().is_empty());
        cleanup(&dir);
    }

    #[test]
    fn test_file_without_frontmatter() {
        let dir = skills_dir();
        write_skill(&dir, "plain", "Just a body, no frontmatter.");
        let manager = SkillManager::new(dir.to_str().unwrap());
        let skills = manager.discover();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "plain");
        assert!(skills[0].body.contains("Just a body"));
        cleanup(&dir);
    }
}
