use indexmap::IndexMap;
use std::sync::Arc;

use crate::error::PlanningError;
use crate::json_ext::Path;
use crate::operation::{Argument, Field, InlineFragment, Operation, OperationKind, Selection};
use crate::query_plan::{
    ExecutionPlan, FetchNode, FlattenNode, NodeId, PlanNode, key_alias, write_selection_set,
};
use crate::supergraph::{Supergraph, TypeRef};

/// Turns a normalized operation into an execution plan for one supergraph.
/// Planning is pure: the same operation and snapshot give the same plan.
pub trait QueryPlanner: Send + Sync {
    fn plan(
        &self,
        schema: &Arc<Supergraph>,
        operation: Arc<Operation>,
    ) -> Result<ExecutionPlan, PlanningError>;
}

/// Plans by field ownership: root fields go to their first owner, and any
/// field its current subgraph can't resolve becomes an `_entities` fetch
/// to its owner, keyed by the parent's entity key.
#[derive(Debug, Default, Clone, Copy)]
pub struct FederatedQueryPlanner;

impl FederatedQueryPlanner {
    pub fn new() -> Self {
        FederatedQueryPlanner
    }
}

impl QueryPlanner for FederatedQueryPlanner {
    fn plan(
        &self,
        schema: &Arc<Supergraph>,
        operation: Arc<Operation>,
    ) -> Result<ExecutionPlan, PlanningError> {
        let mut builder = PlanBuilder {
            schema,
            operation: &operation,
            groups: Vec::new(),
            nodes: Vec::new(),
            fetch_count: 0,
        };
        let root = match operation.kind {
            OperationKind::Subscription => builder.plan_subscription()?,
            OperationKind::Query | OperationKind::Mutation => builder.plan_root()?,
        };
        let nodes = builder.nodes;
        Ok(ExecutionPlan {
            nodes,
            root,
            operation,
            schema: Arc::clone(schema),
        })
    }
}

/// Selections bound for a single subgraph request.
struct FetchGroup {
    service: String,
    /// Where the entities live in the response, for entity groups.
    path: Option<Path>,
    root_selections: Vec<Selection>,
    entity_selections: IndexMap<String, Vec<Selection>>,
    requires: IndexMap<String, Vec<String>>,
    /// Groups that need this group's results first.
    children: Vec<usize>,
}

impl FetchGroup {
    fn new(service: &str, path: Option<Path>) -> Self {
        FetchGroup {
            service: service.to_owned(),
            path,
            root_selections: Vec::new(),
            entity_selections: IndexMap::new(),
            requires: IndexMap::new(),
            children: Vec::new(),
        }
    }
}

struct PlanBuilder<'p> {
    schema: &'p Supergraph,
    operation: &'p Operation,
    groups: Vec<FetchGroup>,
    nodes: Vec<PlanNode>,
    fetch_count: usize,
}

impl<'p> PlanBuilder<'p> {
    fn plan_root(&mut self) -> Result<Option<NodeId>, PlanningError> {
        let operation = self.operation;
        let serial = operation.kind == OperationKind::Mutation;
        let mut root_groups: Vec<usize> = Vec::new();

        for field in root_fields(&operation.selections) {
            if field.name == "__typename" {
                continue;
            }
            let owner = self.first_owner(&operation.root_type, &field.name)?;
            // Mutation fields keep their order: only consecutive fields for
            // the same subgraph share a request.
            let existing = if serial {
                root_groups
                    .last()
                    .copied()
                    .filter(|&last| self.groups[last].service == owner)
            } else {
                root_groups
                    .iter()
                    .copied()
                    .find(|&group| self.groups[group].service == owner)
            };
            let group = match existing {
                Some(group) => group,
                None => {
                    root_groups.push(self.groups.len());
                    self.groups.push(FetchGroup::new(&owner, None));
                    self.groups.len() - 1
                }
            };
            let planned = self.plan_field(group, field, &Path::empty())?;
            push_unique(&mut self.groups[group].root_selections, Selection::Field(planned));
        }

        let mut ids: Vec<NodeId> = root_groups.into_iter().map(|group| self.build(group)).collect();
        Ok(match ids.len() {
            0 => None,
            1 => ids.pop(),
            _ if serial => Some(self.push(PlanNode::Sequence { nodes: ids })),
            _ => Some(self.push(PlanNode::Parallel { nodes: ids })),
        })
    }

    /// Subscriptions go to a single subgraph in one piece; anything that
    /// would need a follow-up entity fetch is rejected. Payloads are relayed
    /// as they arrive, so root `__typename` selections travel upstream too.
    fn plan_subscription(&mut self) -> Result<Option<NodeId>, PlanningError> {
        let operation = self.operation;
        let all = root_fields(&operation.selections);
        let fields: Vec<&Field> = all
            .iter()
            .copied()
            .filter(|field| field.name != "__typename")
            .collect();
        let [field] = fields.as_slice() else {
            return Err(PlanningError::SubscriptionRootFields);
        };

        let owner = self.first_owner(&operation.root_type, &field.name)?;
        let mut services = vec![owner.clone()];
        collect_foreign_owners(self.schema, &owner, &field.selections, &mut services)?;
        if services.len() > 1 {
            return Err(PlanningError::UnsupportedSubscription { services });
        }

        let mut group = FetchGroup::new(&owner, None);
        for root in &all {
            push_unique(&mut group.root_selections, Selection::Field((*root).clone()));
        }
        self.groups.push(group);
        Ok(Some(self.build(self.groups.len() - 1)))
    }

    fn first_owner(&self, type_name: &str, field: &str) -> Result<String, PlanningError> {
        self.schema
            .owners(type_name, field)
            .first()
            .cloned()
            .ok_or_else(|| PlanningError::NoOwner {
                type_name: type_name.to_owned(),
                field: field.to_owned(),
            })
    }

    /// Plans `field`, resolved by `group`, and everything below it.
    fn plan_field(&mut self, group: usize, field: &Field, path: &Path) -> Result<Field, PlanningError> {
        let mut planned = field.without_selections();
        if !field.selections.is_empty() {
            let named = field.ty.named();
            let mut selections = self.split(group, named, &field.selections, &path.for_field(field))?;
            if self.schema.is_abstract(named) && !has_typename(&selections) {
                selections.insert(0, Selection::Field(Field::typename(named)));
            }
            planned.selections = selections;
        }
        Ok(planned)
    }

    /// Keeps what `group` can resolve and moves the rest into child groups.
    fn split(
        &mut self,
        group: usize,
        parent_type: &str,
        selections: &[Selection],
        path: &Path,
    ) -> Result<Vec<Selection>, PlanningError> {
        let schema = self.schema;
        let mut kept = Vec::new();
        for selection in selections {
            match selection {
                Selection::Field(field) if field.name == "__typename" => {
                    push_unique(&mut kept, selection.clone());
                }
                Selection::Field(field) => {
                    let owners = schema.owners(&field.parent_type, &field.name);
                    let Some(first_owner) = owners.first() else {
                        return Err(PlanningError::NoOwner {
                            type_name: field.parent_type.clone(),
                            field: field.name.clone(),
                        });
                    };
                    if owners.contains(&self.groups[group].service) {
                        let planned = self.plan_field(group, field, path)?;
                        push_unique(&mut kept, Selection::Field(planned));
                    } else {
                        self.plan_entity_field(group, first_owner, field, path, &mut kept)?;
                    }
                }
                Selection::InlineFragment(fragment) => {
                    let scope = fragment.type_condition.as_deref().unwrap_or(parent_type);
                    let nested = self.split(group, scope, &fragment.selections, path)?;
                    if !nested.is_empty() {
                        kept.push(Selection::InlineFragment(InlineFragment {
                            type_condition: fragment.type_condition.clone(),
                            directives: fragment.directives.clone(),
                            selections: nested,
                            variables: fragment.variables.clone(),
                        }));
                    }
                }
            }
        }
        Ok(kept)
    }

    /// Routes `field` to `owner` through an entity fetch at `path`, adding
    /// `__typename` and the aliased key fields to the current group's
    /// selections.
    fn plan_entity_field(
        &mut self,
        group: usize,
        owner: &str,
        field: &Field,
        path: &Path,
        kept: &mut Vec<Selection>,
    ) -> Result<(), PlanningError> {
        let schema = self.schema;
        let parent_type = field.parent_type.as_str();
        let current = self.groups[group].service.clone();

        let candidates: Vec<&String> = if schema.is_abstract(parent_type) {
            schema
                .possible_types(parent_type)
                .iter()
                .filter(|possible| schema.entity_key(possible, owner).is_some())
                .collect()
        } else {
            vec![&field.parent_type]
        };

        let mut keys: IndexMap<String, Vec<String>> = IndexMap::new();
        for candidate in candidates {
            let Some(key) = schema.entity_key(candidate, owner) else {
                continue;
            };
            if let Some(missing) = key
                .iter()
                .find(|key_field| !schema.owners(candidate, key_field).contains(&current))
            {
                tracing::debug!(%candidate, %missing, service = %current, "key field not resolvable");
                return Err(PlanningError::UnresolvableKey {
                    type_name: candidate.clone(),
                    service: current,
                });
            }
            keys.insert(candidate.clone(), key.to_vec());
        }
        if keys.is_empty() {
            return Err(PlanningError::NoEntityKey {
                type_name: parent_type.to_owned(),
                service: owner.to_owned(),
            });
        }

        push_unique(kept, Selection::Field(Field::typename(parent_type)));
        for (candidate, key) in &keys {
            let key_fields = key
                .iter()
                .map(|key_field| Selection::Field(key_selection(schema, candidate, key_field)));
            if candidate == parent_type {
                for key_field in key_fields {
                    push_unique(kept, key_field);
                }
            } else {
                push_unique(
                    kept,
                    Selection::InlineFragment(InlineFragment {
                        type_condition: Some(candidate.clone()),
                        directives: Vec::new(),
                        selections: key_fields.collect(),
                        variables: Vec::new(),
                    }),
                );
            }
        }

        let child = self.child_group(group, owner, path);
        let planned = self.plan_field(child, field, path)?;
        let child = &mut self.groups[child];
        for (candidate, key) in keys {
            child.requires.entry(candidate.clone()).or_insert(key);
            push_unique(
                child.entity_selections.entry(candidate).or_default(),
                Selection::Field(planned.clone()),
            );
        }
        Ok(())
    }

    /// Reuses the child of `parent` fetching from `service` at `path`, so
    /// every entity at one path goes out in a single batch.
    fn child_group(&mut self, parent: usize, service: &str, path: &Path) -> usize {
        let existing = self.groups[parent].children.iter().copied().find(|&child| {
            self.groups[child].service == service && self.groups[child].path.as_ref() == Some(path)
        });
        if let Some(child) = existing {
            return child;
        }
        self.groups.push(FetchGroup::new(service, Some(path.clone())));
        let child = self.groups.len() - 1;
        self.groups[parent].children.push(child);
        child
    }

    fn push(&mut self, node: PlanNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    fn build(&mut self, group: usize) -> NodeId {
        let fetch = self.fetch_node(group);
        let mut node = self.push(PlanNode::Fetch(fetch));
        if let Some(path) = self.groups[group].path.clone() {
            node = self.push(PlanNode::Flatten(FlattenNode { path, node }));
        }

        let children = self.groups[group].children.clone();
        if children.is_empty() {
            return node;
        }
        let mut dependents: Vec<NodeId> = children.into_iter().map(|child| self.build(child)).collect();
        let dependent = if dependents.len() == 1 {
            dependents.remove(0)
        } else {
            self.push(PlanNode::Parallel { nodes: dependents })
        };
        self.push(PlanNode::Sequence {
            nodes: vec![node, dependent],
        })
    }

    fn fetch_node(&mut self, group: usize) -> FetchNode {
        let index = self.fetch_count;
        self.fetch_count += 1;
        let schema = self.schema;
        let operation = self.operation;
        let group = &self.groups[group];
        let entity_fetch = group.path.is_some();

        let selections = if entity_fetch {
            let fragments = group
                .entity_selections
                .iter()
                .map(|(type_name, selections)| {
                    let mut fragment = vec![Selection::Field(Field::typename(type_name))];
                    for key_field in group.requires.get(type_name).into_iter().flatten() {
                        push_unique(
                            &mut fragment,
                            Selection::Field(key_selection(schema, type_name, key_field)),
                        );
                    }
                    for selection in selections {
                        push_unique(&mut fragment, selection.clone());
                    }
                    Selection::InlineFragment(InlineFragment {
                        type_condition: Some(type_name.clone()),
                        directives: Vec::new(),
                        selections: fragment,
                        variables: Vec::new(),
                    })
                })
                .collect();
            let mut entities = Field::leaf(
                &operation.root_type,
                "_entities",
                TypeRef::NonNull(Box::new(TypeRef::List(Box::new(TypeRef::Named(
                    "_Entity".to_owned(),
                ))))),
            );
            entities.arguments.push(Argument {
                name: "representations".to_owned(),
                value: "$representations".to_owned(),
            });
            entities.selections = fragments;
            vec![Selection::Field(entities)]
        } else {
            group.root_selections.clone()
        };

        let mut variable_usages = Vec::new();
        collect_variables(&selections, &mut variable_usages);

        let operation_kind = if entity_fetch {
            OperationKind::Query
        } else {
            operation.kind
        };
        let operation_name = operation
            .name
            .as_ref()
            .map(|name| format!("{name}__{}__{index}", group.service));

        let mut definitions = Vec::new();
        if entity_fetch {
            definitions.push("$representations:[_Any!]!".to_owned());
        }
        for variable in &variable_usages {
            if let Some(definition) = operation.variable_definition(variable) {
                let default = definition
                    .default_value
                    .as_ref()
                    .map(|value| format!("={value}"))
                    .unwrap_or_default();
                definitions.push(format!("${}:{}{default}", definition.name, definition.ty));
            }
        }

        let mut document = String::from(operation_kind.as_str());
        if let Some(name) = &operation_name {
            document.push(' ');
            document.push_str(name);
        }
        if !definitions.is_empty() {
            document.push('(');
            document.push_str(&definitions.join(","));
            document.push(')');
        }
        write_selection_set(&selections, &mut document);

        FetchNode {
            service_name: group.service.clone(),
            operation: document,
            operation_name,
            operation_kind,
            variable_usages,
            requires: group.requires.clone(),
        }
    }
}

/// Root fields, looking through inline fragments on the root type.
fn root_fields(selections: &[Selection]) -> Vec<&Field> {
    let mut fields = Vec::new();
    for selection in selections {
        match selection {
            Selection::Field(field) => fields.push(field),
            Selection::InlineFragment(fragment) => fields.extend(root_fields(&fragment.selections)),
        }
    }
    fields
}

fn collect_foreign_owners(
    schema: &Supergraph,
    owner: &str,
    selections: &[Selection],
    services: &mut Vec<String>,
) -> Result<(), PlanningError> {
    for selection in selections {
        match selection {
            Selection::Field(field) if field.name == "__typename" => {}
            Selection::Field(field) => {
                let owners = schema.owners(&field.parent_type, &field.name);
                let Some(first) = owners.first() else {
                    return Err(PlanningError::NoOwner {
                        type_name: field.parent_type.clone(),
                        field: field.name.clone(),
                    });
                };
                if !owners.iter().any(|candidate| candidate == owner) && !services.contains(first) {
                    services.push(first.clone());
                }
                collect_foreign_owners(schema, owner, &field.selections, services)?;
            }
            Selection::InlineFragment(fragment) => {
                collect_foreign_owners(schema, owner, &fragment.selections, services)?;
            }
        }
    }
    Ok(())
}

fn collect_variables(selections: &[Selection], variables: &mut Vec<String>) {
    let add = |names: &[String], variables: &mut Vec<String>| {
        for name in names {
            if !variables.contains(name) {
                variables.push(name.clone());
            }
        }
    };
    for selection in selections {
        match selection {
            Selection::Field(field) => {
                add(&field.variables, variables);
                collect_variables(&field.selections, variables);
            }
            Selection::InlineFragment(fragment) => {
                add(&fragment.variables, variables);
                collect_variables(&fragment.selections, variables);
            }
        }
    }
}

/// A key field under its reserved alias.
fn key_selection(schema: &Supergraph, type_name: &str, key_field: &str) -> Field {
    let ty = schema
        .field(type_name, key_field)
        .map(|definition| definition.ty.clone())
        .unwrap_or_else(|| TypeRef::Named("ID".to_owned()));
    let mut field = Field::leaf(type_name, key_field, ty);
    field.alias = Some(key_alias(key_field));
    field
}

fn has_typename(selections: &[Selection]) -> bool {
    selections
        .iter()
        .any(|selection| matches!(selection, Selection::Field(field) if field.name == "__typename" && field.alias.is_none()))
}

fn push_unique(selections: &mut Vec<Selection>, selection: Selection) {
    if !selections.contains(&selection) {
        selections.push(selection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{operation, supergraph};
    use pretty_assertions::assert_eq;

    fn plan(query: &str) -> Result<ExecutionPlan, PlanningError> {
        let schema = supergraph();
        FederatedQueryPlanner::new().plan(&schema, operation(&schema, query))
    }

    fn documents(plan: &ExecutionPlan) -> Vec<(String, String)> {
        plan.fetches()
            .map(|fetch| (fetch.service_name.clone(), fetch.operation.clone()))
            .collect()
    }

    #[test]
    fn single_subgraph_query_is_one_fetch() {
        let plan = plan("{ me { id username } }").unwrap();
        assert_eq!(
            documents(&plan),
            [("accounts".to_owned(), "query{me{id username}}".to_owned())]
        );
        assert!(matches!(plan.node(plan.root().unwrap()), PlanNode::Fetch(_)));
    }

    #[test]
    fn nested_ownership_becomes_a_chain_of_entity_fetches() {
        let plan = plan("query Top { topProducts { name reviews { body author { username } } } }").unwrap();
        assert_eq!(
            documents(&plan),
            [
                (
                    "products".to_owned(),
                    "query Top__products__0{topProducts{name __typename __key_upc:upc}}".to_owned()
                ),
                (
                    "reviews".to_owned(),
                    "query Top__reviews__1($representations:[_Any!]!){_entities(representations:$representations){...on Product{__typename __key_upc:upc reviews{body author{__typename __key_id:id}}}}}".to_owned()
                ),
                (
                    "accounts".to_owned(),
                    "query Top__accounts__2($representations:[_Any!]!){_entities(representations:$representations){...on User{__typename __key_id:id username}}}".to_owned()
                ),
            ]
        );

        let fetches: Vec<_> = plan.fetches().collect();
        assert_eq!(fetches[1].requires["Product"], ["upc"]);
        assert_eq!(fetches[2].requires["User"], ["id"]);

        let PlanNode::Sequence { nodes } = plan.node(plan.root().unwrap()) else {
            panic!("expected a sequence at the root");
        };
        assert!(matches!(plan.node(nodes[0]), PlanNode::Fetch(_)));
        let PlanNode::Sequence { nodes: inner } = plan.node(nodes[1]) else {
            panic!("expected the dependent fetches in sequence");
        };
        let PlanNode::Flatten(reviews) = plan.node(inner[0]) else {
            panic!("expected a flatten");
        };
        assert_eq!(reviews.path.to_string(), "topProducts.@");
        let PlanNode::Flatten(authors) = plan.node(inner[1]) else {
            panic!("expected a flatten");
        };
        assert_eq!(authors.path.to_string(), "topProducts.@.reviews.@.author");
    }

    #[test]
    fn independent_root_fields_run_in_parallel() {
        let plan = plan("{ me { username } topProducts { name } }").unwrap();
        let PlanNode::Parallel { nodes } = plan.node(plan.root().unwrap()) else {
            panic!("expected a parallel root");
        };
        assert_eq!(nodes.len(), 2);
        assert_eq!(plan.fetches().count(), 2);
    }

    #[test]
    fn mutations_keep_field_order_across_subgraphs() {
        let plan = plan(
            r#"mutation {
                first: login(username: "a") { id }
                addReview(authorID: "1", upc: "top-1", review: "ok") { body }
                second: login(username: "b") { id }
            }"#,
        )
        .unwrap();
        let PlanNode::Sequence { nodes } = plan.node(plan.root().unwrap()) else {
            panic!("expected a sequence root");
        };
        assert_eq!(nodes.len(), 3);
        let services: Vec<_> = plan.fetches().map(|f| f.service_name.as_str()).collect();
        assert_eq!(services, ["accounts", "reviews", "accounts"]);
        assert!(plan.fetches().all(|f| f.operation.starts_with("mutation")));
    }

    #[test]
    fn entity_fetches_carry_only_the_variables_they_use() {
        let plan = plan("query ($n: Int = 2) { topProducts(first: $n) { reviews { body } } }").unwrap();
        let fetches: Vec<_> = plan.fetches().collect();
        assert_eq!(fetches[0].variable_usages, ["n"]);
        assert_eq!(
            fetches[0].operation,
            "query($n:Int=2){topProducts(first:$n){__typename __key_upc:upc}}"
        );
        assert!(fetches[1].variable_usages.is_empty());
        assert!(fetches[1].operation.starts_with("query($representations:[_Any!]!)"));
    }

    #[test]
    fn abstract_fields_get_typename() {
        let plan = plan("{ me { history { ... on Sale { rating } } } }").unwrap();
        assert_eq!(
            documents(&plan)[0].1,
            "query{me{history{__typename ...on Sale{rating}}}}"
        );
    }

    #[test]
    fn fragments_on_union_members_route_nested_entities() {
        let plan = plan("{ histories { ... on Purchase { product { name } } } }").unwrap();
        assert_eq!(
            documents(&plan),
            [
                (
                    "accounts".to_owned(),
                    "query{histories{__typename ...on Purchase{product{__typename __key_upc:upc}}}}".to_owned()
                ),
                (
                    "products".to_owned(),
                    "query($representations:[_Any!]!){_entities(representations:$representations){...on Product{__typename __key_upc:upc name}}}".to_owned()
                ),
            ]
        );
    }

    #[test]
    fn subscriptions_must_stay_in_one_subgraph() {
        let plan = plan("subscription { updateProductPrice(upc: \"top-1\") { upc name price } }").unwrap();
        assert_eq!(plan.kind(), OperationKind::Subscription);
        assert_eq!(
            documents(&plan),
            [(
                "products".to_owned(),
                "subscription{updateProductPrice(upc:\"top-1\"){upc name price}}".to_owned()
            )]
        );

        assert_eq!(
            self::plan("subscription { updatedPrice { name reviews { body } } }").unwrap_err(),
            PlanningError::UnsupportedSubscription {
                services: vec!["products".into(), "reviews".into()]
            }
        );
        assert_eq!(
            self::plan("subscription { updatedPrice { name } reviewAdded { body } }").unwrap_err(),
            PlanningError::SubscriptionRootFields
        );
    }

    #[test]
    fn subscription_root_typename_goes_upstream() {
        let plan = plan("subscription { __typename updatedPrice { name } }").unwrap();
        assert_eq!(
            documents(&plan)[0].1,
            "subscription{__typename updatedPrice{name}}"
        );
    }

    #[test]
    fn key_fields_never_shadow_client_aliases() {
        let plan = plan("{ me { id: username reviews { body } } }").unwrap();
        assert_eq!(
            documents(&plan),
            [
                (
                    "accounts".to_owned(),
                    "query{me{id:username __typename __key_id:id}}".to_owned()
                ),
                (
                    "reviews".to_owned(),
                    "query($representations:[_Any!]!){_entities(representations:$representations){...on User{__typename __key_id:id reviews{body}}}}".to_owned()
                ),
            ]
        );
        let fetches: Vec<_> = plan.fetches().collect();
        assert_eq!(fetches[1].requires["User"], ["id"]);
    }

    #[test]
    fn planning_is_deterministic() {
        let schema = supergraph();
        let query = "query Q { me { reviews { product { name price } } } topProducts { reviews { author { username } } } }";
        let planner = FederatedQueryPlanner::new();
        let first = planner.plan(&schema, operation(&schema, query)).unwrap();
        let second = planner.plan(&schema, operation(&schema, query)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn boundary_fields_at_the_same_path_share_one_fetch() {
        let plan = plan("{ topProducts { reviews { body } r2: reviews { author { id } } } }").unwrap();
        let services: Vec<_> = plan.fetches().map(|f| f.service_name.as_str()).collect();
        assert_eq!(services, ["products", "reviews"]);
    }
}
