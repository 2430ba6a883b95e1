//! One-shot group operations: create a group, invite phone numbers, post a
//! message. Each call runs on its own scoped request session.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    resolver,
    session::{
        self,
        port::{SessionClient, SessionFactory},
        types::{Entity, SessionRole},
    },
    Error, Result,
};

#[derive(Clone, Debug)]
pub struct CreateGroupRequest {
    pub name: String,
    pub description: String,
    pub phones: Vec<String>,
    pub invite_message: String,
}

impl CreateGroupRequest {
    /// Request with the default description and invitation text.
    pub fn new(name: &str, phones: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            description: format!("Group created via API: {name}"),
            phones,
            invite_message: format!("You are invited to join the group: {name}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteStatus {
    Success,
    Error,
}

/// Outcome of inviting one phone number.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InviteResult {
    pub phone: String,
    pub status: InviteStatus,
    pub message: String,
}

impl InviteResult {
    fn ok(phone: &str) -> Self {
        Self {
            phone: phone.to_string(),
            status: InviteStatus::Success,
            message: "Invitation sent successfully".to_string(),
        }
    }

    fn failed(phone: &str, message: String) -> Self {
        Self {
            phone: phone.to_string(),
            status: InviteStatus::Error,
            message,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CreatedGroup {
    pub name: String,
    pub invite_link: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct GroupInvitation {
    pub group: CreatedGroup,
    pub invitations: Vec<InviteResult>,
}

pub struct GroupService {
    factory: Arc<dyn SessionFactory>,
}

impl GroupService {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self { factory }
    }

    /// Create a supergroup, obtain an invite link and invite every phone number.
    pub async fn create_group_with_invites(
        &self,
        req: &CreateGroupRequest,
    ) -> Result<GroupInvitation> {
        let client = session::open_authorized(self.factory.as_ref(), SessionRole::Request).await?;
        let res = create_and_invite(client.as_ref(), req).await;
        session::close(client.as_ref()).await;
        res
    }

    /// Post `text` to the group behind `invite`, labelled with the sender it is
    /// relayed for. Private links are joined first.
    pub async fn send_group_message(
        &self,
        invite: &str,
        sender_name: &str,
        sender_phone: &str,
        text: &str,
    ) -> Result<()> {
        resolver::InviteRef::parse(invite)?;
        let client = session::open_authorized(self.factory.as_ref(), SessionRole::Request).await?;
        let res = async {
            let group = resolver::resolve_entity(client.as_ref(), invite).await?;
            client
                .send_message(&group, &relay_text(sender_name, sender_phone, text))
                .await
        }
        .await;
        session::close(client.as_ref()).await;
        res
    }
}

async fn create_and_invite(
    client: &dyn SessionClient,
    req: &CreateGroupRequest,
) -> Result<GroupInvitation> {
    let group = client.create_group(&req.name, &req.description).await?;
    info!(group = group.id, name = %req.name, "created group");

    let invite_link = invite_link(client, &group).await?;
    let invitations = send_invites(client, &req.phones, &invite_link, &req.invite_message).await;

    Ok(GroupInvitation {
        group: CreatedGroup {
            name: req.name.clone(),
            invite_link,
        },
        invitations,
    })
}

/// The group's invite link: the existing one if set, else a freshly exported one.
pub async fn invite_link(client: &dyn SessionClient, group: &Entity) -> Result<String> {
    match client.existing_invite_link(group).await {
        Ok(Some(link)) if !link.is_empty() => return Ok(link),
        Ok(_) => {}
        Err(e) => warn!(group = group.id, "could not read existing invite link: {e}"),
    }

    match client.export_invite_link(group).await {
        Ok(link) if !link.is_empty() => Ok(link),
        Ok(_) => Err(Error::InviteLinkUnavailable),
        Err(e) => {
            warn!(group = group.id, "could not export invite link: {e}");
            Err(Error::InviteLinkUnavailable)
        }
    }
}

/// Send `"<message>\n\n<link>"` to every phone number. Each number gets its own
/// result; no failure stops the batch.
pub async fn send_invites(
    client: &dyn SessionClient,
    phones: &[String],
    invite_link: &str,
    message: &str,
) -> Vec<InviteResult> {
    let text = format!("{message}\n\n{invite_link}");
    let mut results = Vec::with_capacity(phones.len());

    for phone in phones {
        let user = match client.resolve_entity(phone).await {
            Ok(u) => u,
            Err(e) => {
                results.push(InviteResult::failed(phone, lookup_failure(&e)));
                continue;
            }
        };

        match client.send_message(&user, &text).await {
            Ok(()) => results.push(InviteResult::ok(phone)),
            Err(e) => {
                warn!(%phone, "invitation failed: {e}");
                results.push(InviteResult::failed(phone, send_failure(&e)));
            }
        }
    }

    results
}

fn lookup_failure(e: &Error) -> String {
    match e {
        Error::RateLimited(_) | Error::PrivacyRestricted(_) => send_failure(e),
        other => format!("Could not find user: {other}"),
    }
}

fn send_failure(e: &Error) -> String {
    match e {
        Error::RateLimited(_) => "Telegram flood error. Try again later.".to_string(),
        Error::PrivacyRestricted(_) => "User has privacy restrictions".to_string(),
        other => other.to_string(),
    }
}

pub fn relay_text(sender_name: &str, sender_phone: &str, text: &str) -> String {
    format!("📱 **Mesaj: {sender_name} ({sender_phone})** 📱\n\n{text}")
}
