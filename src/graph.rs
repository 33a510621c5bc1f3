//! Static skill hierarchy, loaded once and read-only afterwards.
//!
//! Skills form a forest through `parent_id`. Ancestor chains are resolved
//! once at construction so the cascade and the recommender only do lookups.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;

use crate::error::{Result, TutorError};
use crate::models::SkillId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    /// Breadcrumb id, e.g. `math_8_1.1.1.1`.
    pub skill_id: SkillId,
    #[serde(default)]
    pub parent_id: Option<SkillId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub prerequisites: Vec<SkillId>,
    #[serde(default)]
    pub starter: bool,
}

impl Skill {
    pub fn new(skill_id: impl Into<SkillId>, parent_id: Option<&str>) -> Self {
        Self {
            skill_id: skill_id.into(),
            parent_id: parent_id.map(str::to_string),
            name: None,
            description: None,
            prerequisites: Vec::new(),
            starter: false,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.skill_id)
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct SkillGraph {
    skills: Vec<Skill>,
    index: HashMap<SkillId, usize>,
    // nearest first
    ancestors: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    prerequisites: Vec<Vec<usize>>,
    explicit_prerequisites: bool,
}

impl SkillGraph {
    /// Builds and validates a graph; `skills` order is the curriculum order.
    pub fn new(skills: Vec<Skill>) -> Result<Self> {
        let mut index = HashMap::with_capacity(skills.len());
        for (i, skill) in skills.iter().enumerate() {
            if skill.skill_id.trim().is_empty() {
                return Err(TutorError::InvalidGraph("empty skill id".to_string()));
            }
            if index.insert(skill.skill_id.clone(), i).is_some() {
                return Err(TutorError::InvalidGraph(format!(
                    "duplicate skill id '{}'",
                    skill.skill_id
                )));
            }
        }

        let mut parents = Vec::with_capacity(skills.len());
        for skill in &skills {
            let parent = match &skill.parent_id {
                Some(pid) => Some(*index.get(pid).ok_or_else(|| {
                    TutorError::InvalidGraph(format!(
                        "skill '{}' has unknown parent '{}'",
                        skill.skill_id, pid
                    ))
                })?),
                None => None,
            };
            parents.push(parent);
        }

        let n = skills.len();
        let mut ancestors = Vec::with_capacity(n);
        let mut children = vec![Vec::new(); n];
        for i in 0..n {
            let mut chain = Vec::new();
            let mut cursor = parents[i];
            while let Some(p) = cursor {
                if chain.len() >= n || p == i {
                    return Err(TutorError::InvalidGraph(format!(
                        "parent cycle through '{}'",
                        skills[i].skill_id
                    )));
                }
                chain.push(p);
                cursor = parents[p];
            }
            if let Some(p) = parents[i] {
                children[p].push(i);
            }
            ancestors.push(chain);
        }

        let explicit_prerequisites = skills.iter().any(|s| !s.prerequisites.is_empty());
        let mut prerequisites = Vec::with_capacity(n);
        for (i, skill) in skills.iter().enumerate() {
            if explicit_prerequisites {
                let mut prereqs = Vec::with_capacity(skill.prerequisites.len());
                for pid in &skill.prerequisites {
                    let p = *index.get(pid).ok_or_else(|| {
                        TutorError::InvalidGraph(format!(
                            "skill '{}' has unknown prerequisite '{}'",
                            skill.skill_id, pid
                        ))
                    })?;
                    if p == i {
                        return Err(TutorError::InvalidGraph(format!(
                            "skill '{}' lists itself as a prerequisite",
                            skill.skill_id
                        )));
                    }
                    prereqs.push(p);
                }
                prerequisites.push(prereqs);
            } else {
                prerequisites.push(parents[i].into_iter().collect());
            }
        }

        let graph = Self {
            skills,
            index,
            ancestors,
            children,
            prerequisites,
            explicit_prerequisites,
        };
        graph.check_prerequisites_acyclic()?;
        Ok(graph)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let skills: Vec<Skill> = serde_json::from_str(raw)?;
        Self::new(skills)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let graph = Self::from_json_str(&raw)?;
        tracing::info!(
            path = %path.display(),
            skills = graph.len(),
            explicit_prerequisites = graph.explicit_prerequisites,
            "skill graph loaded"
        );
        Ok(graph)
    }

    // Kahn's algorithm over prerequisite -> dependent edges.
    fn check_prerequisites_acyclic(&self) -> Result<()> {
        let n = self.skills.len();
        let mut indegree: Vec<usize> = self.prerequisites.iter().map(Vec::len).collect();
        let mut dependents = vec![Vec::new(); n];
        for (i, prereqs) in self.prerequisites.iter().enumerate() {
            for &p in prereqs {
                dependents[p].push(i);
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut visited = 0;
        while let Some(i) = queue.pop_front() {
            visited += 1;
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    queue.push_back(d);
                }
            }
        }

        if visited == n {
            Ok(())
        } else {
            Err(TutorError::InvalidGraph(
                "prerequisite edges contain a cycle".to_string(),
            ))
        }
    }

    fn idx(&self, skill_id: &str) -> Result<usize> {
        self.index
            .get(skill_id)
            .copied()
            .ok_or_else(|| TutorError::UnknownSkill(skill_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Skill> {
        self.skills.iter()
    }

    pub fn contains(&self, skill_id: &str) -> bool {
        self.index.contains_key(skill_id)
    }

    pub fn get_skill(&self, skill_id: &str) -> Option<&Skill> {
        self.index.get(skill_id).map(|&i| &self.skills[i])
    }

    /// Ancestor ids, nearest first.
    pub fn get_ancestors(&self, skill_id: &str) -> Result<Vec<&str>> {
        let i = self.idx(skill_id)?;
        Ok(self.ancestors[i]
            .iter()
            .map(|&a| self.skills[a].skill_id.as_str())
            .collect())
    }

    /// Root-first path ending at the skill itself.
    pub fn breadcrumb(&self, skill_id: &str) -> Result<Vec<&str>> {
        let mut path = self.get_ancestors(skill_id)?;
        path.reverse();
        path.push(self.skills[self.idx(skill_id)?].skill_id.as_str());
        Ok(path)
    }

    pub fn depth(&self, skill_id: &str) -> Result<usize> {
        Ok(self.ancestors[self.idx(skill_id)?].len())
    }

    pub fn children(&self, skill_id: &str) -> Result<Vec<&Skill>> {
        let i = self.idx(skill_id)?;
        Ok(self.children[i].iter().map(|&c| &self.skills[c]).collect())
    }

    pub fn roots(&self) -> Vec<&Skill> {
        self.skills.iter().filter(|s| s.is_root()).collect()
    }

    /// Flagged starter skills, or every root without prerequisites when none are flagged.
    pub fn starters(&self) -> Vec<&Skill> {
        let flagged: Vec<&Skill> = self.skills.iter().filter(|s| s.starter).collect();
        if !flagged.is_empty() {
            return flagged;
        }
        self.skills
            .iter()
            .zip(&self.prerequisites)
            .filter(|(s, prereqs)| s.is_root() && prereqs.is_empty())
            .map(|(s, _)| s)
            .collect()
    }

    pub fn is_starter(&self, skill_id: &str) -> bool {
        self.starters().iter().any(|s| s.skill_id == skill_id)
    }

    pub fn has_explicit_prerequisites(&self) -> bool {
        self.explicit_prerequisites
    }

    /// Direct prerequisites: the explicit edge set, or the parent when none is declared.
    pub fn prerequisites_of(&self, skill_id: &str) -> Result<Vec<&str>> {
        let i = self.idx(skill_id)?;
        Ok(self.prerequisites[i]
            .iter()
            .map(|&p| self.skills[p].skill_id.as_str())
            .collect())
    }

    /// Skills that must reach the ready threshold before `skill_id` unlocks:
    /// the declared prerequisites when the graph has explicit edges, else
    /// the whole ancestor chain.
    pub fn gating_skills(&self, skill_id: &str) -> Result<Vec<&str>> {
        if self.explicit_prerequisites {
            self.prerequisites_of(skill_id)
        } else {
            self.get_ancestors(skill_id)
        }
    }

    /// `(prerequisite, dependent)` pairs.
    pub fn get_prerequisite_edges(&self) -> BTreeSet<(SkillId, SkillId)> {
        self.prerequisites
            .iter()
            .enumerate()
            .flat_map(|(i, prereqs)| {
                prereqs.iter().map(move |&p| {
                    (
                        self.skills[p].skill_id.clone(),
                        self.skills[i].skill_id.clone(),
                    )
                })
            })
            .collect()
    }
}
