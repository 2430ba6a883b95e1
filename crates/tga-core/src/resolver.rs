//! Invite reference parsing and group resolution.

use crate::{
    domain::GroupRef,
    session::{port::SessionClient, types::Entity},
    Error, Result,
};

const LINK_MARKER: &str = "t.me/";

/// A parsed invite reference.
///
/// Any link containing a literal `+` is treated as a private invite link and
/// everything else as a public handle. This is a heuristic over the platform's
/// link format, not a validation of it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InviteRef {
    /// Private invite link, resolved as a whole (e.g. `https://t.me/+AbCd123`).
    Private { link: String },
    /// Public group/channel handle without scheme or prefix.
    Public { handle: String },
}

impl InviteRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let link = raw.trim();
        let Some(pos) = link.find(LINK_MARKER) else {
            return Err(Error::MalformedReference(format!(
                "invalid invite link format: {link}"
            )));
        };

        if link.contains('+') {
            return Ok(Self::Private {
                link: link.to_string(),
            });
        }

        let handle = link[pos + LINK_MARKER.len()..].trim_matches('/');
        if handle.is_empty() {
            return Err(Error::MalformedReference(format!(
                "invite link has no handle: {link}"
            )));
        }
        Ok(Self::Public {
            handle: handle.to_string(),
        })
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Self::Private { .. })
    }
}

/// Resolve `invite` to a group, joining it first when it is a private link the
/// account is not yet a member of. Resolving an already-joined group is a no-op.
pub async fn resolve(client: &dyn SessionClient, invite: &str) -> Result<GroupRef> {
    let entity = resolve_entity(client, invite).await?;
    Ok(GroupRef {
        id: entity.group_id(),
        title: entity.display_title(),
        invite: invite.to_string(),
    })
}

/// Like [`resolve`], but returns the raw entity so callers can keep using it.
pub async fn resolve_entity(client: &dyn SessionClient, invite: &str) -> Result<Entity> {
    match InviteRef::parse(invite)? {
        InviteRef::Private { link } => {
            let mut entity = client.resolve_entity(&link).await.map_err(as_resolve)?;
            if !entity.is_member {
                tracing::info!(group = entity.id, "joining group via invite link");
                client.join(&entity).await.map_err(as_join)?;
                entity.is_member = true;
            }
            Ok(entity)
        }
        InviteRef::Public { handle } => client.resolve_entity(&handle).await.map_err(as_resolve),
    }
}

// Authorization and connectivity problems keep their own kind.
fn as_resolve(e: Error) -> Error {
    match e {
        Error::ResolveFailed(_) | Error::NotAuthorized | Error::Connection(_) => e,
        other => Error::ResolveFailed(other.to_string()),
    }
}

fn as_join(e: Error) -> Error {
    match e {
        Error::JoinFailed(_) | Error::NotAuthorized | Error::Connection(_) => e,
        other => Error::JoinFailed(other.to_string()),
    }
}
