//! Human-readable derivations for unsolvable manifests.

use crate::source::Dependency;
use crate::version::{GemVersion, Requirement};

/// `parent version` requires `child requirement`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Edge {
    pub parent: String,
    pub version: GemVersion,
    /// Every viable version of `parent` has this same edge.
    pub every: bool,
    pub child: String,
    pub requirement: Requirement,
}

impl Edge {
    fn subject(&self) -> String {
        if self.every {
            format!("every version of {}", self.parent)
        } else {
            format!("{} {}", self.parent, self.version)
        }
    }

    fn term(&self) -> String {
        format!("{} {}", self.child, self.requirement)
    }

    fn text(&self) -> String {
        format!("{} depends on {}", self.subject(), self.term())
    }
}

/// How the manifest reaches a package: its top-level requirement, then the
/// edges leading down to the package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Chain {
    pub root: Dependency,
    pub edges: Vec<Edge>,
}

impl Chain {
    /// The link that constrains the final package.
    fn link(&self) -> String {
        match self.edges.last() {
            Some(edge) => edge.text(),
            None => format!("{ROOT} depends on {}", self.root),
        }
    }

    fn subject(&self) -> String {
        match self.edges.last() {
            Some(edge) => format!("{} {}", edge.parent, edge.version),
            None => ROOT.to_string(),
        }
    }

    fn root_text(&self) -> String {
        format!("{ROOT} depends on {}", self.root)
    }
}

const ROOT: &str = "the manifest";

/// The first dead end met by the search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Failure {
    /// No permitted source offers a version matching the last link.
    Missing {
        chain: Chain,
        term: Dependency,
        location: String,
    },
    /// Two or more requirements on one package exclude each other.
    Conflict { chains: Vec<Chain> },
}

pub(crate) fn render(failure: &Failure) -> String {
    match failure {
        Failure::Missing {
            chain,
            term,
            location,
        } => render_missing(chain, term, location),
        Failure::Conflict { chains } => render_conflict(chains),
    }
}

fn render_missing(chain: &Chain, term: &Dependency, location: &str) -> String {
    let missing = format!("{term} could not be found in {location}");
    let Some((first, rest)) = chain.edges.split_first() else {
        return format!(
            "Because {}\n  and {missing},\n  version solving has failed.",
            chain.root_text()
        );
    };

    let top = &first.parent;
    let mut out = format!("Because {}", first.text());
    match rest.split_first() {
        None => out.push_str(&format!("\n  and {missing},\n  {top} cannot be used.\n")),
        Some((second, more)) => {
            out.push_str(&format!(
                "\n  and {},\n  {} requires {}.\n",
                second.text(),
                first.subject(),
                second.term()
            ));
            for edge in more {
                out.push_str(&format!(
                    "And because {},\n  {} requires {}.\n",
                    edge.text(),
                    first.subject(),
                    edge.term()
                ));
            }
            out.push_str(&format!("And because {missing},\n  {top} cannot be used.\n"));
        }
    }
    out.push_str(&format!(
        "So, because {},\n  version solving has failed.",
        chain.root_text()
    ));
    out
}

fn render_conflict(chains: &[Chain]) -> String {
    let mut out = String::new();
    let links: Vec<String> = chains.iter().map(Chain::link).collect();
    let subjects: Vec<String> = chains.iter().map(Chain::subject).collect();
    out.push_str(&format!("Because {}", links.join("\n  and ")));
    out.push_str(&format!(
        ",\n  {} is incompatible with {}.\n",
        subjects[0],
        subjects[1..].join(" and ")
    ));

    for chain in chains {
        if chain.edges.len() < 2 {
            continue;
        }
        let upper = &chain.edges[..chain.edges.len() - 1];
        let texts: Vec<String> = upper.iter().map(Edge::text).collect();
        let last = &upper[upper.len() - 1];
        out.push_str(&format!(
            "And because {},\n  {} requires {} {}.\n",
            texts.join("\n  and "),
            upper[0].subject(),
            last.child,
            last.requirement
        ));
    }

    let mut roots: Vec<String> = Vec::new();
    for chain in chains {
        let text = chain.root_text();
        if !roots.contains(&text) {
            roots.push(text);
        }
    }
    out.push_str(&format!(
        "So, because {},\n  version solving has failed.",
        roots.join("\n  and ")
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(s: &str) -> Requirement {
        Requirement::parse(s).unwrap()
    }

    fn edge(parent: &str, version: &str, every: bool, child: &str, requirement: &str) -> Edge {
        Edge {
            parent: parent.to_string(),
            version: GemVersion::parse(version).unwrap(),
            every,
            child: child.to_string(),
            requirement: req(requirement),
        }
    }

    #[test]
    fn missing_transitive_dependency() {
        let failure = Failure::Missing {
            chain: Chain {
                root: Dependency::new("depends_on_missing", req(">= 0")),
                edges: vec![edge("depends_on_missing", "1.0", true, "missing", ">= 0")],
            },
            term: Dependency::new("missing", req(">= 0")),
            location: "any of the sources".to_string(),
        };
        assert_eq!(
            render(&failure),
            "Because every version of depends_on_missing depends on missing >= 0\n  \
             and missing >= 0 could not be found in any of the sources,\n  \
             depends_on_missing cannot be used.\n\
             So, because the manifest depends on depends_on_missing >= 0,\n  \
             version solving has failed."
        );
    }

    #[test]
    fn missing_two_levels_down() {
        let failure = Failure::Missing {
            chain: Chain {
                root: Dependency::new("a", req(">= 0")),
                edges: vec![
                    edge("a", "1.0", true, "b", ">= 1"),
                    edge("b", "1.0", false, "c", "~> 2.0"),
                ],
            },
            term: Dependency::new("c", req("~> 2.0")),
            location: "rubygems repository https://gem.repo1/".to_string(),
        };
        assert_eq!(
            render(&failure),
            "Because every version of a depends on b >= 1\n  \
             and b 1.0 depends on c ~> 2.0,\n  \
             every version of a requires c ~> 2.0.\n\
             And because c ~> 2.0 could not be found in rubygems repository https://gem.repo1/,\n  \
             a cannot be used.\n\
             So, because the manifest depends on a >= 0,\n  \
             version solving has failed."
        );
    }

    #[test]
    fn conflicting_siblings() {
        let failure = Failure::Conflict {
            chains: vec![
                Chain {
                    root: Dependency::new("a", req(">= 0")),
                    edges: vec![edge("a", "1.0", false, "c", "= 1.0")],
                },
                Chain {
                    root: Dependency::new("b", req(">= 0")),
                    edges: vec![edge("b", "1.0", false, "c", "= 2.0")],
                },
            ],
        };
        assert_eq!(
            render(&failure),
            "Because a 1.0 depends on c = 1.0\n  \
             and b 1.0 depends on c = 2.0,\n  \
             a 1.0 is incompatible with b 1.0.\n\
             So, because the manifest depends on a >= 0\n  \
             and the manifest depends on b >= 0,\n  \
             version solving has failed."
        );
    }

    #[test]
    fn conflict_with_root_requirement() {
        let failure = Failure::Conflict {
            chains: vec![
                Chain {
                    root: Dependency::new("c", req("= 1.0")),
                    edges: Vec::new(),
                },
                Chain {
                    root: Dependency::new("a", req(">= 0")),
                    edges: vec![
                        edge("a", "1.0", true, "b", ">= 0"),
                        edge("b", "2.0", false, "c", ">= 2.0"),
                    ],
                },
            ],
        };
        let text = render(&failure);
        assert!(text.starts_with(
            "Because the manifest depends on c = 1.0\n  and b 2.0 depends on c >= 2.0,\n  \
             the manifest is incompatible with b 2.0.\n"
        ));
        assert!(text.contains("And because every version of a depends on b >= 0,\n  every version of a requires b >= 0.\n"));
        assert!(text.ends_with("version solving has failed."));
    }
}
