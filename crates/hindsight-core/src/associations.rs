//! Relationship mirroring from a live entity onto its history entity.
//!
//! Runs once, from the history entity's before-sync hook, so the mirrored
//! foreign keys exist before the history table is materialised.

use crate::{
  Error, Result,
  engine::Engine,
  hooks::Hook,
  model::{Relationship, RelationshipKind},
  registry::Registry,
};

/// How a live relationship is redeclared on the history entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorStrategy {
  /// Same relationship, foreign-key constraint kept with `NO ACTION`.
  Constrained,
  /// Metadata only; the target entity is never re-pointed at history.
  Unconstrained,
  /// Metadata only, and the history entity is re-keyed on the live
  /// primary key.
  ManyToMany,
}

pub const fn strategy(kind: RelationshipKind) -> MirrorStrategy {
  match kind {
    RelationshipKind::BelongsTo => MirrorStrategy::Constrained,
    RelationshipKind::HasOne | RelationshipKind::HasMany => MirrorStrategy::Unconstrained,
    RelationshipKind::BelongsToMany => MirrorStrategy::ManyToMany,
  }
}

/// Before-sync hook for a history entity.
pub fn mirror_hook<E: Engine>(model_suffix: String) -> Hook<E> {
  Hook::sync(move |registry, history| {
    mirror_relationships(registry, history, &model_suffix).map(|_| ())
  })
}

/// Mirror the origin's relationships onto `history` and link the pair.
///
/// Returns `false` when there is nothing to do: mirroring disabled, no
/// registered origin, the origin is itself a history entity, or it declares
/// no relationships.
pub fn mirror_relationships<E: Engine>(
  registry: &mut Registry<E>,
  history: &str,
  model_suffix: &str,
) -> Result<bool> {
  let history_def = registry.entity(history)?;
  if !history_def.add_associations {
    return Ok(false);
  }
  let Some(origin) = history_def.origin.clone() else {
    return Ok(false);
  };
  let Some(live) = registry.get(&origin) else {
    return Ok(false);
  };
  if live.is_history() || live.name.ends_with(model_suffix) || live.relationships.is_empty() {
    return Ok(false);
  }

  let live_keys: Vec<String> = live.primary_keys().map(|a| a.name.clone()).collect();
  let Some(pk) = live_keys.first().cloned() else {
    return Err(Error::SchemaDerivation(format!("{origin} has no primary key")));
  };
  let relationships: Vec<Relationship> = live
    .relationships
    .iter()
    .filter(|r| r.target != history)
    .cloned()
    .collect();

  for relationship in relationships {
    let mut mirrored = relationship.no_action();
    match strategy(mirrored.kind) {
      MirrorStrategy::Constrained => {}
      MirrorStrategy::Unconstrained => mirrored = mirrored.without_constraints(),
      MirrorStrategy::ManyToMany => {
        mirrored = mirrored.without_constraints();
        rekey_on_live_primary_key(registry, history, &live_keys)?;
      }
    }
    registry.associate(history, mirrored)?;
  }

  registry.associate(
    &origin,
    Relationship::has_many(history).foreign_key(&pk).no_action().without_constraints(),
  )?;
  registry.associate(
    history,
    Relationship::belongs_to(&origin).foreign_key(&pk).no_action().without_constraints(),
  )?;

  let definition = registry.entity(history)?.clone();
  registry.register(definition);
  tracing::debug!(live = %origin, history, "mirrored relationships");
  Ok(true)
}

/// The history entity's own surrogate key is its primary key, so the copied
/// live keys must not auto-increment; relationships key on the first one.
fn rekey_on_live_primary_key<E: Engine>(
  registry: &mut Registry<E>,
  history: &str,
  live_keys: &[String],
) -> Result<()> {
  let history_def = registry
    .get_mut(history)
    .ok_or_else(|| Error::UnknownEntity(history.to_owned()))?;
  for key in live_keys {
    if let Some(attr) = history_def.attribute_mut(key) {
      attr.auto_increment = false;
    }
  }
  history_def.association_key = live_keys.first().cloned();
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    config::HistoryConfig,
    hooks::LifecycleEvent,
    intercept::attach_history,
    model::{Attribute, DataType, EntityDefinition, ReferentialAction, References},
    testing::MemoryEngine,
  };

  fn registry(add_associations: bool) -> Registry<MemoryEngine> {
    let mut reg = Registry::new();
    reg
      .define(EntityDefinition::new("Team").with_attribute(Attribute::new("title", DataType::Text)))
      .unwrap();
    reg
      .define(EntityDefinition::new("Tag").with_attribute(Attribute::new("label", DataType::Text)))
      .unwrap();
    reg
      .define(EntityDefinition::new("Post").with_attribute(Attribute::new("body", DataType::Text)))
      .unwrap();
    reg
      .define(EntityDefinition::new("User").with_attribute(Attribute::new("name", DataType::Text)))
      .unwrap();
    reg
      .associate(
        "User",
        Relationship::belongs_to("Team").on_delete(ReferentialAction::Cascade),
      )
      .unwrap();
    reg.associate("User", Relationship::has_many("Post")).unwrap();
    reg
      .associate("User", Relationship::belongs_to_many("Tag", "UserTags"))
      .unwrap();
    attach_history(
      &mut reg,
      "User",
      HistoryConfig::default().add_associations(add_associations),
    )
    .unwrap();
    reg
  }

  #[test]
  fn strategy_per_kind() {
    assert_eq!(strategy(RelationshipKind::BelongsTo), MirrorStrategy::Constrained);
    assert_eq!(strategy(RelationshipKind::HasOne), MirrorStrategy::Unconstrained);
    assert_eq!(strategy(RelationshipKind::HasMany), MirrorStrategy::Unconstrained);
    assert_eq!(strategy(RelationshipKind::BelongsToMany), MirrorStrategy::ManyToMany);
  }

  #[test]
  fn disabled_mirroring_does_nothing() {
    let mut reg = registry(false);
    reg.run_sync_hooks("UserHistory", LifecycleEvent::BeforeSync).unwrap();
    assert!(reg.entity("UserHistory").unwrap().relationships.is_empty());
    assert_eq!(reg.entity("User").unwrap().relationships.len(), 3);
  }

  #[test]
  fn relationships_are_mirrored_with_no_action() {
    let mut reg = registry(true);
    reg.run_sync_hooks("UserHistory", LifecycleEvent::BeforeSync).unwrap();

    let history = reg.entity("UserHistory").unwrap();
    let kinds: Vec<_> = history.relationships.iter().map(|r| (r.kind, r.target.as_str())).collect();
    assert_eq!(
      kinds,
      [
        (RelationshipKind::BelongsTo, "Team"),
        (RelationshipKind::HasMany, "Post"),
        (RelationshipKind::BelongsToMany, "Tag"),
        (RelationshipKind::BelongsTo, "User"),
      ]
    );
    for rel in &history.relationships {
      assert_eq!(rel.options.on_delete, Some(ReferentialAction::NoAction));
      assert_eq!(rel.options.on_update, Some(ReferentialAction::NoAction));
    }

    let fk = history.attribute("teamId").unwrap();
    assert_eq!(fk.references, Some(References { entity: "Team".into(), key: "id".into() }));
    assert_eq!(fk.on_delete, Some(ReferentialAction::NoAction));

    // Live side keeps its own cascade.
    let live_fk = reg.entity("User").unwrap().attribute("teamId").unwrap();
    assert_eq!(live_fk.on_delete, Some(ReferentialAction::Cascade));
  }

  #[test]
  fn targets_are_never_repointed_at_history() {
    let mut reg = registry(true);
    let post_before = reg.entity("Post").unwrap().clone();
    reg.run_sync_hooks("UserHistory", LifecycleEvent::BeforeSync).unwrap();
    assert_eq!(reg.entity("Post").unwrap(), &post_before);
  }

  #[test]
  fn many_to_many_rekeys_history_on_live_primary_key() {
    let mut reg = registry(true);
    reg.run_sync_hooks("UserHistory", LifecycleEvent::BeforeSync).unwrap();

    let history = reg.entity("UserHistory").unwrap();
    assert_eq!(history.association_key.as_deref(), Some("id"));
    assert_eq!(history.association_field(), Some("id"));
    assert!(!history.attribute("id").unwrap().auto_increment);
    assert_eq!(history.primary_key_field(), Some("hid"));
    // The live key is untouched.
    assert!(reg.entity("User").unwrap().attribute("id").unwrap().auto_increment);
  }

  #[test]
  fn live_and_history_are_linked() {
    let mut reg = registry(true);
    reg.run_sync_hooks("UserHistory", LifecycleEvent::BeforeSync).unwrap();

    let link = reg
      .entity("User")
      .unwrap()
      .relationships
      .iter()
      .find(|r| r.target == "UserHistory")
      .unwrap()
      .clone();
    assert_eq!(link.kind, RelationshipKind::HasMany);
    assert_eq!(link.options.foreign_key.as_deref(), Some("id"));
    assert!(!link.options.constraints);
  }

  #[test]
  fn mirroring_twice_is_idempotent() {
    let mut reg = registry(true);
    reg.run_sync_hooks("UserHistory", LifecycleEvent::BeforeSync).unwrap();
    let history = reg.entity("UserHistory").unwrap().clone();
    let live = reg.entity("User").unwrap().clone();

    reg.run_sync_hooks("UserHistory", LifecycleEvent::BeforeSync).unwrap();

    assert_eq!(reg.entity("UserHistory").unwrap(), &history);
    assert_eq!(reg.entity("User").unwrap(), &live);
  }

  #[test]
  fn origin_without_relationships_is_skipped() {
    let mut reg = Registry::<MemoryEngine>::new();
    reg
      .define(EntityDefinition::new("Note").with_attribute(Attribute::new("body", DataType::Text)))
      .unwrap();
    attach_history(&mut reg, "Note", HistoryConfig::default().add_associations(true)).unwrap();

    assert!(!mirror_relationships(&mut reg, "NoteHistory", "History").unwrap());
    assert!(reg.entity("Note").unwrap().relationships.is_empty());
  }
}
