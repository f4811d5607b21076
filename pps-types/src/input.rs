use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An input repository read directly by a pipeline's workers.
///
/// `glob` is carried for completeness of the data model (it determines how
/// the data-store partitions files across workers); the master itself
/// never inspects it, it only exists downstream in the worker harness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomInput {
    pub repo: String,
    pub branch: String,
    pub glob: String,
}

/// A cron-triggered input: the master itself produces commits into
/// `repo` on `spec`'s schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronInput {
    pub name: String,
    pub repo: String,
    /// Standard five-field cron syntax.
    pub spec: String,
    pub start: DateTime<Utc>,
    pub overwrite: bool,
}

/// Recursive tagged variant describing how a pipeline's inputs compose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Input {
    Cron(CronInput),
    Atom(AtomInput),
    Union(Vec<Input>),
    Cross(Vec<Input>),
}

impl Input {
    /// Visitor traversal applying `f` to every `Cron` leaf.
    pub fn visit_crons<'a>(&'a self, f: &mut impl FnMut(&'a CronInput)) {
        match self {
            Input::Cron(c) => f(c),
            Input::Atom(_) => {}
            Input::Union(children) | Input::Cross(children) => {
                for child in children {
                    child.visit_crons(f);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cron(name: &str) -> Input {
        Input::Cron(CronInput {
            name: name.into(),
            repo: format!("{name}-repo"),
            spec: "@every 1m".into(),
            start: Utc::now(),
            overwrite: false,
        })
    }

    fn atom(repo: &str) -> Input {
        Input::Atom(AtomInput {
            repo: repo.into(),
            branch: "master".into(),
            glob: "/*".into(),
        })
    }

    #[test]
    fn visits_all_cron_leaves_in_nested_composites() {
        let tree = Input::Cross(vec![
            atom("images"),
            Input::Union(vec![cron("hourly"), cron("daily")]),
        ]);
        let mut names = Vec::new();
        tree.visit_crons(&mut |c| names.push(c.name.clone()));
        assert_eq!(names, vec!["hourly", "daily"]);
    }

    #[test]
    fn atom_only_tree_has_no_cron_leaves() {
        let tree = Input::Cross(vec![atom("a"), atom("b")]);
        let mut count = 0;
        tree.visit_crons(&mut |_| count += 1);
        assert_eq!(count, 0);
    }
}
