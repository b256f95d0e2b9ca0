//! # Protocol authorization
//!
//! Structural and access-control validation for protocol-bound records:
//! rule-set resolution by protocol path, type/schema/format checks, parent
//! and context ancestry, role records, and action-rule matching for each
//! operation.

use crate::protocols::{Action, Actor, Definition, RuleSet, rule_set};
use crate::provider::MessageStore;
use crate::records::write::initial_entry;
use crate::records::{Delete, RecordsFilter, Write};
use crate::store::RecordsQueryBuilder;
use crate::{Error, Result, forbidden, schema, unexpected};

/// Validate the structure of a protocol-bound `RecordsWrite`: its type, its
/// position in the record tree, role-record integrity, size limits, and
/// tags.
pub(crate) async fn verify_integrity(
    owner: &str, write: &Write, store: &impl MessageStore,
) -> Result<()> {
    let Some(protocol) = &write.descriptor.protocol else {
        return Err(unexpected!("missing protocol"));
    };
    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(unexpected!("missing protocol path"));
    };

    let definition = fetch_definition(owner, protocol, store).await?;
    let Some(rule_set) = rule_set(protocol_path, &definition.structure) else {
        return Err(forbidden!(
            "ProtocolAuthorizationMissingRuleSet: no rule set defined for protocol path \
             {protocol_path}"
        ));
    };

    verify_type(write, &definition)?;
    verify_ancestry(owner, write, store).await?;
    if rule_set.role.unwrap_or_default() {
        verify_role_record(owner, write, store).await?;
    }
    verify_size_limit(write.descriptor.data_size, rule_set)?;
    if let Some(tags) = &rule_set.tags {
        schema::validate_tags(protocol, protocol_path, tags, write.descriptor.tags.as_ref())?;
    }

    Ok(())
}

/// Protocol-based authorization for `RecordsWrite` messages.
pub(crate) async fn permit_write(
    owner: &str, write: &Write, store: &impl MessageStore,
) -> Result<()> {
    let Some(protocol) = &write.descriptor.protocol else {
        return Err(unexpected!("missing protocol"));
    };
    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(unexpected!("missing protocol path"));
    };

    let definition = fetch_definition(owner, protocol, store).await?;
    let Some(rule_set) = rule_set(protocol_path, &definition.structure) else {
        return Err(forbidden!(
            "ProtocolAuthorizationMissingRuleSet: no rule set defined for protocol path \
             {protocol_path}"
        ));
    };

    let author = write.authorization.author()?;
    let invoked_role = write.authorization.payload()?.protocol_role;
    if let Some(role) = &invoked_role {
        verify_invoked_role(owner, &author, protocol, role, write.context_id.as_deref(), &definition, store)
            .await?;
    }

    // the actions the incoming message amounts to
    let allowed_actions = if write.is_initial()? {
        vec![Action::Create]
    } else if let Some(initial) = initial_entry(owner, &write.record_id, store).await? {
        if author == initial.authorization.author()? {
            vec![Action::Update, Action::CoUpdate]
        } else {
            vec![Action::CoUpdate]
        }
    } else {
        vec![Action::Create]
    };

    // ancestors are consulted by `of`-scoped rules
    let chain = record_chain(owner, write, store).await?;

    verify_actions(write, &author, invoked_role.as_deref(), &allowed_actions, rule_set, &chain)
}

/// Protocol-based authorization for reading the specified record.
pub(crate) async fn permit_read(
    owner: &str, author: &str, protocol_role: Option<&str>, write: &Write,
    store: &impl MessageStore,
) -> Result<()> {
    let Some(protocol) = &write.descriptor.protocol else {
        return Err(forbidden!("read request failed authorization"));
    };
    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(forbidden!("read request failed authorization"));
    };

    let definition = fetch_definition(owner, protocol, store).await?;
    let Some(rule_set) = rule_set(protocol_path, &definition.structure) else {
        return Err(forbidden!(
            "ProtocolAuthorizationMissingRuleSet: no rule set defined for protocol path \
             {protocol_path}"
        ));
    };

    if let Some(role) = protocol_role {
        verify_invoked_role(owner, author, protocol, role, write.context_id.as_deref(), &definition, store)
            .await?;
    }

    let chain = record_chain_for(owner, &write.record_id, store).await?;
    verify_entry_actions(
        author,
        protocol_role,
        &[Action::Read],
        rule_set,
        write,
        &chain,
    )
}

/// Protocol-based authorization for `RecordsQuery` and `RecordsSubscribe`
/// filters that invoke a protocol role.
pub(crate) async fn permit_query(
    owner: &str, author: &str, protocol_role: &str, action: &Action, filter: &RecordsFilter,
    store: &impl MessageStore,
) -> Result<()> {
    let Some(protocol) = &filter.protocol else {
        return Err(forbidden!("missing protocol in role-invoking filter"));
    };

    let definition = fetch_definition(owner, protocol, store).await?;
    verify_invoked_role(
        owner,
        author,
        protocol,
        protocol_role,
        filter.context_id.as_deref().or(filter.context_id_prefix.as_deref()),
        &definition,
        store,
    )
    .await?;

    // the role must be permitted the action at the filtered path
    let Some(protocol_path) = &filter.protocol_path else {
        return Err(forbidden!("missing protocol path in role-invoking filter"));
    };
    let Some(rule_set) = rule_set(protocol_path, &definition.structure) else {
        return Err(forbidden!(
            "ProtocolAuthorizationMissingRuleSet: no rule set defined for protocol path \
             {protocol_path}"
        ));
    };

    for rule in rule_set.actions.as_ref().unwrap_or(&Vec::new()) {
        if rule.can.contains(action) && rule.role.as_deref() == Some(protocol_role) {
            return Ok(());
        }
    }

    Err(forbidden!(
        "ProtocolAuthorizationActionNotAllowed: role {protocol_role} is not permitted to \
         {action:?} at {protocol_path}"
    ))
}

/// Protocol-based authorization for `RecordsDelete` messages.
pub(crate) async fn permit_delete(
    owner: &str, delete: &Delete, write: &Write, store: &impl MessageStore,
) -> Result<()> {
    let Some(protocol) = &write.descriptor.protocol else {
        return Err(forbidden!("delete request failed authorization"));
    };
    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(forbidden!("delete request failed authorization"));
    };

    let definition = fetch_definition(owner, protocol, store).await?;
    let Some(rule_set) = rule_set(protocol_path, &definition.structure) else {
        return Err(forbidden!(
            "ProtocolAuthorizationMissingRuleSet: no rule set defined for protocol path \
             {protocol_path}"
        ));
    };

    let author = delete.authorization.author()?;
    let invoked_role = delete.authorization.payload()?.protocol_role;
    if let Some(role) = &invoked_role {
        verify_invoked_role(owner, &author, protocol, role, write.context_id.as_deref(), &definition, store)
            .await?;
    }

    let initial_author = write.authorization.author()?;
    let mut allowed_actions = vec![Action::CoDelete];
    if author == initial_author {
        allowed_actions.push(Action::Delete);
    }
    if delete.descriptor.prune {
        allowed_actions.push(Action::CoPrune);
        if author == initial_author {
            allowed_actions.push(Action::Prune);
        }
    }

    let chain = record_chain_for(owner, &write.record_id, store).await?;
    verify_entry_actions(
        &author,
        invoked_role.as_deref(),
        &allowed_actions,
        rule_set,
        write,
        &chain,
    )
}

/// Fetch the active protocol definition configured on the owner's node.
pub(crate) async fn fetch_definition(
    owner: &str, protocol_uri: &str, store: &impl MessageStore,
) -> Result<Definition> {
    let query = crate::store::ProtocolsQuery {
        protocol: Some(protocol_uri.to_string()),
        published: None,
    };
    let (entries, _) = store.query(owner, &query.into()).await?;

    let Some(entry) = entries.last() else {
        return Err(Error::NotFound(format!(
            "ProtocolAuthorizationProtocolNotFound: unable to find protocol definition for \
             {protocol_uri}"
        )));
    };
    let Some(configure) = entry.as_configure() else {
        return Err(unexpected!("expected `ProtocolsConfigure` message"));
    };

    Ok(configure.descriptor.definition.clone())
}

// Verify `data_format` and `schema` match the record's declared type.
fn verify_type(write: &Write, definition: &Definition) -> Result<()> {
    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(unexpected!("missing protocol path"));
    };
    let Some(type_name) = protocol_path.split('/').next_back() else {
        return Err(unexpected!("missing type name"));
    };
    let Some(protocol_type) = definition.types.get(type_name) else {
        return Err(forbidden!(
            "ProtocolAuthorizationInvalidType: record with type {type_name} not allowed in \
             protocol"
        ));
    };

    if protocol_type.schema.is_some() && protocol_type.schema != write.descriptor.schema {
        return Err(forbidden!(
            "ProtocolAuthorizationInvalidSchema: invalid schema for type {type_name}"
        ));
    }
    if let Some(data_formats) = &protocol_type.data_formats {
        if !data_formats.contains(&write.descriptor.data_format) {
            return Err(forbidden!(
                "ProtocolAuthorizationIncorrectDataFormat: invalid data format for type \
                 {type_name}"
            ));
        }
    }

    Ok(())
}

// Verify the record's protocol path and context id agree with its actual
// parent chain.
async fn verify_ancestry(owner: &str, write: &Write, store: &impl MessageStore) -> Result<()> {
    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(unexpected!("missing protocol path"));
    };
    let Some(type_name) = protocol_path.split('/').next_back() else {
        return Err(unexpected!("missing type name"));
    };

    // subsequent writes inherit these fields verbatim from the initial
    // write, so ancestry only needs proving once
    if !write.is_initial()? {
        return Ok(());
    }

    let Some(parent_id) = &write.descriptor.parent_id else {
        if protocol_path != type_name {
            return Err(forbidden!(
                "ProtocolAuthorizationIncorrectProtocolPath: invalid protocol path for \
                 parentless record"
            ));
        }
        if write.context_id.as_ref() != Some(&write.record_id) {
            return Err(unexpected!("invalid `context_id` for parentless record"));
        }
        return Ok(());
    };

    let Some(parent) = initial_entry(owner, parent_id, store).await? else {
        return Err(forbidden!(
            "ProtocolAuthorizationIncorrectProtocolPath: unable to find parent record \
             {parent_id}"
        ));
    };
    if parent.descriptor.protocol != write.descriptor.protocol {
        return Err(forbidden!(
            "ProtocolAuthorizationIncorrectProtocolPath: parent record belongs to another \
             protocol"
        ));
    }

    let Some(parent_path) = &parent.descriptor.protocol_path else {
        return Err(unexpected!("missing parent protocol path"));
    };
    if &format!("{parent_path}/{type_name}") != protocol_path {
        return Err(forbidden!(
            "ProtocolAuthorizationIncorrectProtocolPath: protocol path is not a child of the \
             parent's"
        ));
    }

    let Some(parent_context) = &parent.context_id else {
        return Err(unexpected!("missing parent context id"));
    };
    if write.context_id.as_ref() != Some(&format!("{parent_context}/{}", write.record_id)) {
        return Err(unexpected!("invalid `context_id` for record parent"));
    }

    Ok(())
}

// A role record marks its recipient as a role holder; a DID can hold a role
// at most once per context.
async fn verify_role_record(owner: &str, write: &Write, store: &impl MessageStore) -> Result<()> {
    let Some(recipient) = &write.descriptor.recipient else {
        return Err(unexpected!("role record is missing recipient"));
    };
    let Some(protocol) = &write.descriptor.protocol else {
        return Err(unexpected!("missing protocol"));
    };
    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(unexpected!("missing protocol path"));
    };

    let mut filter = RecordsFilter::new()
        .protocol(protocol.clone())
        .protocol_path(protocol_path.clone())
        .add_recipient(recipient.clone());

    // scope the uniqueness check to the parent context
    if let Some(parent_context) =
        write.context_id.as_ref().and_then(|context| context.rsplit_once('/').map(|x| x.0))
    {
        filter = filter.context_id_prefix(parent_context.to_string());
    }

    let query = RecordsQueryBuilder::new().add_filter(filter).build();
    let (entries, _) = store.query(owner, &query).await?;

    for entry in entries {
        if let Some(matched) = entry.as_write() {
            if matched.record_id != write.record_id {
                return Err(forbidden!(
                    "DID '{recipient}' is already recipient of a role record at {protocol_path}"
                ));
            }
        }
    }

    Ok(())
}

// Verify the invoked role names a role record type and that the author
// actually holds the role in the relevant context.
async fn verify_invoked_role(
    owner: &str, author: &str, protocol: &str, protocol_role: &str, context_id: Option<&str>,
    definition: &Definition, store: &impl MessageStore,
) -> Result<()> {
    let Some(role_rule_set) = rule_set(protocol_role, &definition.structure) else {
        return Err(forbidden!(
            "ProtocolAuthorizationMissingRuleSet: no rule set defined for role {protocol_role}"
        ));
    };
    if !role_rule_set.role.unwrap_or_default() {
        return Err(forbidden!(
            "protocol path {protocol_role} does not match a role record type"
        ));
    }

    // a nested role is scoped to its context: the shared ancestor segments
    let segment_count = protocol_role.split('/').count();
    let mut filter = RecordsFilter::new()
        .protocol(protocol.to_string())
        .protocol_path(protocol_role.to_string())
        .add_recipient(author.to_string());

    if segment_count > 1 {
        let Some(context_id) = context_id else {
            return Err(forbidden!("unable to verify role without a context"));
        };
        let segments: Vec<&str> = context_id.split('/').collect();
        let prefix = segments[..(segment_count - 1).min(segments.len())].join("/");
        filter = filter.context_id_prefix(prefix);
    }

    let query = RecordsQueryBuilder::new().add_filter(filter).build();
    let (entries, _) = store.query(owner, &query).await?;
    if entries.is_empty() {
        return Err(forbidden!(
            "ProtocolAuthorizationActionNotAllowed: no role record found for {author} in role \
             {protocol_role}"
        ));
    }

    Ok(())
}

fn verify_size_limit(data_size: usize, rule_set: &RuleSet) -> Result<()> {
    let Some(range) = &rule_set.size else {
        return Ok(());
    };

    if let Some(min) = range.min {
        if data_size < min {
            return Err(forbidden!("data size is less than allowed"));
        }
    }
    if let Some(max) = range.max {
        if data_size > max {
            return Err(forbidden!("data size is greater than allowed"));
        }
    }

    Ok(())
}

// Match the write against the rule set's action rules.
fn verify_actions(
    write: &Write, author: &str, invoked_role: Option<&str>, allowed_actions: &[Action],
    rule_set: &RuleSet, chain: &[Write],
) -> Result<()> {
    let Some(action_rules) = &rule_set.actions else {
        return Err(forbidden!(
            "ProtocolAuthorizationActionNotAllowed: no action rule defined for RecordsWrite, \
             {author} is unauthorized"
        ));
    };

    for rule in action_rules {
        if !rule.can.iter().any(|action| allowed_actions.contains(action)) {
            continue;
        }
        if rule.who == Some(Actor::Anyone) {
            return Ok(());
        }

        // a role invocation matches role rules only
        if invoked_role.is_some() {
            if rule.role.as_deref() == invoked_role {
                return Ok(());
            }
            continue;
        }

        // a recipient rule without `of` targets this record
        if rule.who == Some(Actor::Recipient) && rule.of.is_none() {
            if write.descriptor.recipient.as_deref() == Some(author) {
                return Ok(());
            }
            continue;
        }

        if check_actor(author, rule, chain)? {
            return Ok(());
        }
    }

    Err(forbidden!(
        "ProtocolAuthorizationActionNotAllowed: RecordsWrite by {author} not allowed"
    ))
}

// Match a read or delete of `write` against the rule set's action rules.
fn verify_entry_actions(
    author: &str, invoked_role: Option<&str>, allowed_actions: &[Action], rule_set: &RuleSet,
    write: &Write, chain: &[Write],
) -> Result<()> {
    let Some(action_rules) = &rule_set.actions else {
        return Err(forbidden!(
            "ProtocolAuthorizationActionNotAllowed: no action rule defined, {author} is \
             unauthorized"
        ));
    };

    for rule in action_rules {
        if !rule.can.iter().any(|action| allowed_actions.contains(action)) {
            continue;
        }
        if rule.who == Some(Actor::Anyone) {
            return Ok(());
        }

        if invoked_role.is_some() {
            if rule.role.as_deref() == invoked_role {
                return Ok(());
            }
            continue;
        }

        if rule.who == Some(Actor::Recipient) && rule.of.is_none() {
            if write.descriptor.recipient.as_deref() == Some(author) {
                return Ok(());
            }
            continue;
        }

        if check_actor(author, rule, chain)? {
            return Ok(());
        }
    }

    Err(forbidden!("ProtocolAuthorizationActionNotAllowed: {author} is not authorized"))
}

// Check the rule's actor against the named ancestor in the record chain.
fn check_actor(author: &str, rule: &crate::protocols::ActionRule, chain: &[Write]) -> Result<bool> {
    let Some(ancestor) =
        chain.iter().find(|write| write.descriptor.protocol_path.as_deref() == rule.of.as_deref())
    else {
        return Ok(false);
    };

    if rule.who == Some(Actor::Recipient) {
        return Ok(ancestor.descriptor.recipient.as_deref() == Some(author));
    }
    Ok(author == ancestor.authorization.author()?)
}

// The chain of initial writes from the root record down to (and including)
// the incoming record's closest existing ancestor.
async fn record_chain(owner: &str, write: &Write, store: &impl MessageStore) -> Result<Vec<Write>> {
    if initial_entry(owner, &write.record_id, store).await?.is_some() {
        record_chain_for(owner, &write.record_id, store).await
    } else if let Some(parent_id) = &write.descriptor.parent_id {
        record_chain_for(owner, parent_id, store).await
    } else {
        Ok(Vec::new())
    }
}

// Walk parent links from the specified record to the root, returning
// initial writes root-first.
async fn record_chain_for(
    owner: &str, record_id: &str, store: &impl MessageStore,
) -> Result<Vec<Write>> {
    let mut chain = Vec::new();
    let mut current_id = Some(record_id.to_owned());

    while let Some(record_id) = &current_id {
        let Some(initial) = initial_entry(owner, record_id, store).await? else {
            return Err(forbidden!(
                "no parent found with ID {record_id} when constructing record chain"
            ));
        };
        current_id.clone_from(&initial.descriptor.parent_id);
        chain.push(initial);
    }

    chain.reverse();
    Ok(chain)
}
