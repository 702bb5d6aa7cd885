// hops-common/src/dependency/resolver.rs

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::dependency::{DependencyTag, Requirement};
use crate::error::{HopsError, Result};
use crate::formulary::Formulary;
use crate::keg::InstalledRegistry;
use crate::model::condition::EvalContext;
use crate::model::configuration::Configuration;
use crate::model::formula::Formula;
use crate::model::options::{EnabledOptions, OptionSelection};

pub struct ResolutionContext<'a> {
    pub formulary: &'a Formulary,
    pub registry: &'a dyn InstalledRegistry,
    pub configuration: &'a Configuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStatus {
    Installed,
    Missing,
    Requested,
}

#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub formula: Arc<Formula>,
    /// Options requested for this node by the user or by dependents.
    pub selection: OptionSelection,
    pub options: EnabledOptions,
    pub accumulated_tags: DependencyTag,
    pub status: ResolutionStatus,
    pub keg_path: Option<PathBuf>,
    pub opt_path: PathBuf,
}

impl ResolvedNode {
    pub fn name(&self) -> &str {
        self.formula.name()
    }

    pub fn needs_build(&self) -> bool {
        self.status != ResolutionStatus::Installed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRequirement {
    pub requirement: Requirement,
    pub required_by: String,
}

/// Output of resolution: every formula needed for the root, dependencies
/// strictly before dependents, the root last.
#[derive(Debug, Clone)]
pub struct ResolvedGraph {
    pub order: Vec<ResolvedNode>,
    pub requirements: Vec<ResolvedRequirement>,
    edges: BTreeMap<String, Vec<(String, DependencyTag)>>,
}

impl ResolvedGraph {
    pub fn root(&self) -> Option<&ResolvedNode> {
        self.order.last()
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedNode> {
        self.order.iter().find(|n| n.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(ResolvedNode::name).collect()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|n| n.name() == name)
    }

    pub fn to_build(&self) -> impl Iterator<Item = &ResolvedNode> {
        self.order.iter().filter(|n| n.needs_build())
    }

    pub fn direct_dependencies(&self, name: &str) -> Vec<(&ResolvedNode, DependencyTag)> {
        self.edges
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|(child, tags)| self.get(child).map(|node| (node, *tags)))
            .collect()
    }

    /// Everything `name` needs while building: its direct dependencies plus
    /// the runtime dependencies of those, transitively. Entries come in
    /// resolution order; tags are those of the direct edge they hang off.
    pub fn build_closure(&self, name: &str) -> Vec<(&ResolvedNode, DependencyTag)> {
        let mut tags_by_name: HashMap<&str, DependencyTag> = HashMap::new();
        let mut stack: Vec<(&str, DependencyTag)> = self
            .edges
            .get(name)
            .into_iter()
            .flatten()
            .map(|(child, tags)| (child.as_str(), *tags))
            .collect();

        while let Some((current, tags)) = stack.pop() {
            let entry = tags_by_name.entry(current).or_insert(DependencyTag::empty());
            if entry.contains(tags) {
                continue;
            }
            *entry |= tags;
            for (child, edge_tags) in self.edges.get(current).into_iter().flatten() {
                if !edge_tags.is_build_only() {
                    stack.push((child.as_str(), tags));
                }
            }
        }

        self.order
            .iter()
            .filter_map(|node| tags_by_name.get(node.name()).map(|tags| (node, *tags)))
            .collect()
    }

    pub fn requirements_for(&self, name: &str) -> Vec<&Requirement> {
        self.requirements
            .iter()
            .filter(|r| r.required_by == name)
            .map(|r| &r.requirement)
            .collect()
    }
}

pub struct DependencyResolver<'a> {
    context: ResolutionContext<'a>,
    root: String,
    /// Nodes on the current DFS path, in visiting order.
    visiting: Vec<String>,
    resolution_details: HashMap<String, ResolvedNode>,
    edges: HashMap<String, Vec<(String, DependencyTag)>>,
    requirements: BTreeMap<(String, String), Requirement>,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(context: ResolutionContext<'a>) -> Self {
        Self {
            context,
            root: String::new(),
            visiting: Vec::new(),
            resolution_details: HashMap::new(),
            edges: HashMap::new(),
            requirements: BTreeMap::new(),
        }
    }

    pub fn resolve(&mut self, root: &str) -> Result<ResolvedGraph> {
        debug!("Starting dependency resolution for '{}'", root);
        self.root = root.to_string();
        self.visiting.clear();
        self.resolution_details.clear();
        self.edges.clear();
        self.requirements.clear();

        let selection = self.context.configuration.selection.clone();
        self.resolve_recursive(root, DependencyTag::RUNTIME, &selection, true)?;
        self.prune_unreachable();

        let order = self.topological_sort()?;
        debug!(
            "Resolved order for '{}': {:?}",
            root,
            order
                .iter()
                .map(|n| (n.name().to_string(), n.status))
                .collect::<Vec<_>>()
        );

        Ok(ResolvedGraph {
            order,
            requirements: self
                .requirements
                .iter()
                .map(|((required_by, _), requirement)| ResolvedRequirement {
                    requirement: requirement.clone(),
                    required_by: required_by.clone(),
                })
                .collect(),
            edges: self
                .edges
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }

    fn resolve_recursive(
        &mut self,
        name: &str,
        tags_from_parent_edge: DependencyTag,
        requested: &OptionSelection,
        is_initial_target: bool,
    ) -> Result<()> {
        debug!(
            "Resolving: {} (requested as {}, options {:?})",
            name,
            tags_from_parent_edge,
            requested.entries()
        );

        // -------- cycle guard ----------------------------------------------------------
        if let Some(pos) = self.visiting.iter().position(|n| n == name) {
            let mut cycle = self.visiting[pos..].to_vec();
            cycle.push(name.to_string());
            error!("Dependency cycle detected: {}", cycle.join(" -> "));
            return Err(HopsError::CyclicDependency { cycle });
        }

        // -------- revisit: merge tags, re-expand only when options grew ------------------
        if let Some(existing) = self.resolution_details.get_mut(name) {
            existing.accumulated_tags |= tags_from_parent_edge;
            if !existing.selection.merge(name, requested)? {
                debug!("'{}' already resolved with compatible options.", name);
                return Ok(());
            }
            existing.options = existing.formula.resolve_options(&existing.selection)?;
            if existing.status == ResolutionStatus::Installed {
                warn!(
                    "'{}' is already installed; requested options {:?} only apply when it is rebuilt",
                    name,
                    requested.entries()
                );
            }
            debug!("Re-evaluating dependencies for '{}' due to new options", name);
        }
        // -------- first time we see this node ------------------------------------------
        else {
            let formula = self.context.formulary.load_formula(name)?;
            let options = formula.resolve_options(requested)?;
            let keg = self.context.registry.installed_keg(name)?;
            let status = if is_initial_target {
                ResolutionStatus::Requested
            } else if keg.is_some() {
                ResolutionStatus::Installed
            } else {
                ResolutionStatus::Missing
            };
            debug!("Initial status for '{}': {:?}, keg: {:?}", name, status, keg);

            self.resolution_details.insert(
                name.to_string(),
                ResolvedNode {
                    formula,
                    selection: requested.clone(),
                    options,
                    accumulated_tags: tags_from_parent_edge,
                    status,
                    keg_path: keg.map(|k| k.path),
                    opt_path: self.context.registry.opt_path(name),
                },
            );
        }

        self.expand(name)
    }

    /// Walks the enabled edges of `name` and records them.
    fn expand(&mut self, name: &str) -> Result<()> {
        let Some(node) = self.resolution_details.get(name).cloned() else {
            return Err(HopsError::Generic(format!(
                "resolver lost track of '{name}'"
            )));
        };
        let platform = &self.context.configuration.platform;
        let include_test = self.context.configuration.include_test && name == self.root;

        let (dependencies, requirements) = {
            let ctx = EvalContext {
                options: &node.options,
                platform,
            };
            let deps: Vec<_> = node
                .formula
                .enabled_dependencies(&ctx, include_test)
                .into_iter()
                .cloned()
                .collect();
            let reqs: Vec<Requirement> = node
                .formula
                .enabled_requirements(&ctx)
                .into_iter()
                .cloned()
                .collect();
            (deps, reqs)
        };

        self.visiting.push(name.to_string());
        let mut children = Vec::new();
        for dep in &dependencies {
            if node.status == ResolutionStatus::Installed && dep.tags.is_build_only() {
                debug!(
                    "RESOLVER: skipping build-only edge '{}' -> '{}' of installed formula",
                    name, dep.name
                );
                continue;
            }
            children.push((dep.name.clone(), dep.tags));
            self.resolve_recursive(&dep.name, dep.tags, &dep.options, false)?;
        }
        self.visiting.pop();

        self.edges.insert(name.to_string(), children);
        self.requirements.retain(|(owner, _), _| owner != name);
        if node.needs_build() {
            for requirement in requirements {
                self.requirements
                    .insert((name.to_string(), requirement.name.clone()), requirement);
            }
        }
        debug!("Finished resolving '{}'", name);
        Ok(())
    }

    /// Drops nodes no longer reachable after option changes removed edges.
    fn prune_unreachable(&mut self) {
        let mut reachable = HashSet::new();
        let mut stack = vec![self.root.clone()];
        while let Some(current) = stack.pop() {
            if !reachable.insert(current.clone()) {
                continue;
            }
            if let Some(children) = self.edges.get(&current) {
                stack.extend(children.iter().map(|(c, _)| c.clone()));
            }
        }
        let before = self.resolution_details.len();
        self.resolution_details.retain(|name, _| reachable.contains(name));
        self.edges.retain(|name, _| reachable.contains(name));
        self.requirements
            .retain(|(owner, _), _| reachable.contains(owner));
        if before != self.resolution_details.len() {
            debug!(
                "Pruned {} unreachable node(s)",
                before - self.resolution_details.len()
            );
        }
    }

    /// Kahn's algorithm over dependency edges with a name-ordered ready set.
    fn topological_sort(&self) -> Result<Vec<ResolvedNode>> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, BTreeSet<&str>> = HashMap::new();

        for name in self.resolution_details.keys() {
            in_degree.entry(name.as_str()).or_default();
        }
        for (parent, children) in &self.edges {
            let unique: BTreeSet<&str> = children.iter().map(|(c, _)| c.as_str()).collect();
            for child in unique {
                if dependents.entry(child).or_default().insert(parent.as_str()) {
                    *in_degree.entry(parent.as_str()).or_default() += 1;
                }
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut sorted = Vec::with_capacity(self.resolution_details.len());

        while let Some(name) = ready.pop_first() {
            if let Some(node) = self.resolution_details.get(name) {
                sorted.push(node.clone());
            }
            for parent in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(parent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(parent);
                    }
                }
            }
        }

        if sorted.len() != self.resolution_details.len() {
            let mut remaining: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(name, _)| name.to_string())
                .collect();
            remaining.sort();
            error!("Cycle detected among: {:?}", remaining);
            return Err(HopsError::CyclicDependency { cycle: remaining });
        }
        Ok(sorted)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::Path;

    use super::*;
    use crate::keg::InstalledKeg;
    use crate::model::platform::{Arch, Compiler, CompilerFamily, OsFamily, Platform, ToolVersion};

    const SHA: &str = "9c9152e74134b68b0f3a1c7083764adc1cb56fd8336bec003fd0ca550cd2461d";

    struct FakeRegistry {
        installed: HashSet<String>,
    }

    impl InstalledRegistry for FakeRegistry {
        fn installed_keg(&self, name: &str) -> Result<Option<InstalledKeg>> {
            Ok(self.installed.contains(name).then(|| InstalledKeg {
                name: name.to_string(),
                version_str: "1.0".to_string(),
                path: Path::new("/cellar").join(name).join("1.0"),
            }))
        }

        fn opt_path(&self, name: &str) -> PathBuf {
            Path::new("/opt").join(name)
        }
    }

    fn formula(name: &str, extra: &str) -> Formula {
        Formula::from_json_str(&format!(
            r#"{{"name": "{name}", "version": "1.0",
                "source": {{"url": "https://example.org/{name}.tgz", "sha256": "{SHA}"}}
                {extra}}}"#
        ))
        .unwrap()
    }

    fn configuration(selection: &[&str]) -> Configuration {
        let platform = Platform {
            os: OsFamily::Linux,
            arch: Arch::X86_64,
            os_version: None,
            compiler: Compiler {
                family: CompilerFamily::Gcc,
                version: ToolVersion::parse("12.2").unwrap(),
            },
        };
        Configuration::new(OptionSelection::parse(selection).unwrap(), platform, 2)
    }

    fn resolve(
        formulas: Vec<Formula>,
        installed: &[&str],
        root: &str,
        selection: &[&str],
    ) -> Result<ResolvedGraph> {
        let formulary = Formulary::from_formulas(formulas);
        let registry = FakeRegistry {
            installed: installed.iter().map(|s| s.to_string()).collect(),
        };
        let configuration = configuration(selection);
        let mut resolver = DependencyResolver::new(ResolutionContext {
            formulary: &formulary,
            registry: &registry,
            configuration: &configuration,
        });
        resolver.resolve(root)
    }

    fn scenario() -> Vec<Formula> {
        vec![
            formula(
                "a",
                r#", "options": [{"name": "with-feature"}],
                     "dependencies": ["b", {"name": "c", "tags": ["build"], "when": {"with": "feature"}}]"#,
            ),
            formula("b", ""),
            formula("c", ""),
        ]
    }

    #[test]
    fn disabled_feature_leaves_optional_dependency_out() {
        let graph = resolve(scenario(), &[], "a", &[]).unwrap();
        assert_eq!(graph.names(), vec!["b", "a"]);
        assert_eq!(graph.root().unwrap().status, ResolutionStatus::Requested);
        assert_eq!(graph.get("b").unwrap().status, ResolutionStatus::Missing);
    }

    #[test]
    fn enabled_feature_orders_dependencies_first() {
        let graph = resolve(scenario(), &[], "a", &["with-feature"]).unwrap();
        assert_eq!(graph.order.len(), 3);
        let a = graph.position("a").unwrap();
        assert!(graph.position("b").unwrap() < a);
        assert!(graph.position("c").unwrap() < a);
    }

    #[test]
    fn cycles_are_reported_with_their_path() {
        let formulas = vec![
            formula("a", r#", "dependencies": ["b"]"#),
            formula("b", r#", "dependencies": ["a"]"#),
        ];
        match resolve(formulas, &[], "a", &[]) {
            Err(HopsError::CyclicDependency { cycle }) => {
                assert_eq!(cycle, vec!["a", "b", "a"]);
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn cycle_behind_disabled_option_is_ignored() {
        let formulas = vec![
            formula(
                "a",
                r#", "dependencies": [{"name": "b", "tags": ["optional"]}]"#,
            ),
            formula("b", r#", "dependencies": ["a"]"#),
        ];
        assert!(resolve(formulas.clone(), &[], "a", &[]).is_ok());
        assert!(matches!(
            resolve(formulas, &[], "a", &["with-b"]),
            Err(HopsError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn shared_dependencies_appear_once() {
        let formulas = vec![
            formula("app", r#", "dependencies": ["left", "right"]"#),
            formula("left", r#", "dependencies": ["base"]"#),
            formula("right", r#", "dependencies": ["base"]"#),
            formula("base", ""),
        ];
        let graph = resolve(formulas, &[], "app", &[]).unwrap();
        assert_eq!(graph.names(), vec!["base", "left", "right", "app"]);
    }

    #[test]
    fn resolution_is_repeatable_and_orders_every_edge() {
        let formulas = vec![
            formula(
                "app",
                r#", "options": [{"name": "with-docs"}],
                     "dependencies": ["left", "right", {"name": "texinfo", "tags": ["build"], "when": {"with": "docs"}},
                                      {"name": "valgrind", "tags": ["optional"]}]"#,
            ),
            formula("left", r#", "dependencies": ["base", "zlib"]"#),
            formula("right", r#", "dependencies": ["base"]"#),
            formula("base", r#", "dependencies": ["zlib"]"#),
            formula("zlib", ""),
            formula("texinfo", r#", "dependencies": ["zlib"]"#),
            formula("valgrind", ""),
        ];
        let selection = ["with-docs", "with-valgrind"];
        let first = resolve(formulas.clone(), &[], "app", &selection).unwrap();
        let second = resolve(formulas, &[], "app", &selection).unwrap();
        assert_eq!(first.names(), second.names());
        assert_eq!(first.order.len(), 7);
        assert_eq!(first.root().unwrap().name(), "app");

        for node in &first.order {
            let parent = first.position(node.name()).unwrap();
            for (child, _) in first.direct_dependencies(node.name()) {
                assert!(
                    first.position(child.name()).unwrap() < parent,
                    "{} must come before {}",
                    child.name(),
                    node.name()
                );
            }
        }
    }

    #[test]
    fn dependents_requesting_different_choices_conflict() {
        let formulas = vec![
            formula("app", r#", "dependencies": ["stats", "plots"]"#),
            formula(
                "stats",
                r#", "dependencies": [{"name": "r", "options": ["blas=openblas"]}]"#,
            ),
            formula(
                "plots",
                r#", "dependencies": [{"name": "r", "options": ["blas=accelerate"]}]"#,
            ),
            formula(
                "r",
                r#", "options": [{"name": "blas", "values": ["accelerate", "openblas"]}]"#,
            ),
        ];
        match resolve(formulas, &[], "app", &[]) {
            Err(HopsError::InvalidOption { formula, .. }) => assert_eq!(formula, "r"),
            other => panic!("expected an option conflict, got {other:?}"),
        }
    }

    #[test]
    fn installed_formulas_skip_their_build_dependencies() {
        let formulas = vec![
            formula("app", r#", "dependencies": ["lib"]"#),
            formula(
                "lib",
                r#", "dependencies": [{"name": "cmake", "tags": ["build"]}, "zlib"]"#,
            ),
            formula("cmake", ""),
            formula("zlib", ""),
        ];
        let graph = resolve(formulas.clone(), &["lib", "zlib"], "app", &[]).unwrap();
        assert_eq!(graph.names(), vec!["zlib", "lib", "app"]);
        assert_eq!(graph.to_build().count(), 1);

        let graph = resolve(formulas, &[], "app", &[]).unwrap();
        assert!(graph.get("cmake").is_some());
    }

    #[test]
    fn options_requested_by_dependents_are_merged() {
        let formulas = vec![
            formula("madlib", r#", "dependencies": ["postgresql", "wrapper"]"#),
            formula(
                "wrapper",
                r#", "dependencies": [{"name": "postgresql", "options": ["with-python"]}]"#,
            ),
            formula(
                "postgresql",
                r#", "dependencies": [{"name": "python", "tags": ["optional"]}]"#,
            ),
            formula("python", ""),
        ];
        let graph = resolve(formulas, &[], "madlib", &[]).unwrap();
        let pg = graph.get("postgresql").unwrap();
        assert!(pg.options.with("python"));
        assert!(graph.position("python").unwrap() < graph.position("postgresql").unwrap());
    }

    #[test]
    fn build_closure_follows_runtime_edges_only() {
        let formulas = vec![
            formula(
                "app",
                r#", "dependencies": [{"name": "tool", "tags": ["build"]}, "lib"]"#,
            ),
            formula(
                "tool",
                r#", "dependencies": ["toolrt", {"name": "toolbuild", "tags": ["build"]}]"#,
            ),
            formula("toolrt", ""),
            formula("toolbuild", ""),
            formula("lib", ""),
        ];
        let graph = resolve(formulas, &[], "app", &[]).unwrap();
        let closure: Vec<(&str, DependencyTag)> = graph
            .build_closure("app")
            .into_iter()
            .map(|(n, t)| (n.name(), t))
            .collect();
        let names: Vec<&str> = closure.iter().map(|(n, _)| *n).collect();
        assert!(names.contains(&"tool"));
        assert!(names.contains(&"toolrt"));
        assert!(names.contains(&"lib"));
        assert!(!names.contains(&"toolbuild"));
        let toolrt = closure.iter().find(|(n, _)| *n == "toolrt").unwrap();
        assert!(toolrt.1.is_build_only());
    }

    #[test]
    fn requirements_are_collected_for_enabled_edges() {
        let formulas = vec![formula(
            "r",
            r#", "requirements": [{"name": "fortran", "executables": ["gfortran"]},
                                  {"name": "x11", "tags": ["optional"]}]"#,
        )];
        let graph = resolve(formulas, &[], "r", &[]).unwrap();
        let names: Vec<&str> = graph
            .requirements_for("r")
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["fortran"]);
    }

    #[test]
    fn missing_formula_fails_resolution() {
        let formulas = vec![formula("a", r#", "dependencies": ["ghost"]"#)];
        assert!(matches!(
            resolve(formulas, &[], "a", &[]),
            Err(HopsError::NotFound(_))
        ));
    }
}
