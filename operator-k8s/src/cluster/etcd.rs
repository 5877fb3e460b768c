use std::time::Duration;

use etcd_client::{Client, ConnectOptions};
use tracing::debug;

use super::member::Member;

/// Request timeout of every membership operation
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Dial timeout of the quorum client
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// The outcome of a member registration
#[derive(Debug)]
pub(crate) struct MemberAdded {
    /// The id the data plane assigned to the new member
    pub(crate) id: u64,
    /// The full membership after the registration
    pub(crate) members: Vec<Member>,
}

/// Open a quorum client with bounded timeouts
async fn connect(endpoints: &[String]) -> Result<Client, etcd_client::Error> {
    let options = ConnectOptions::new()
        .with_timeout(DEFAULT_REQUEST_TIMEOUT)
        .with_connect_timeout(DEFAULT_DIAL_TIMEOUT);
    Client::connect(endpoints, Some(options)).await
}

/// The membership the data plane currently knows.
/// A member that has not started yet is returned with an empty name.
pub(crate) async fn member_list(endpoints: &[String]) -> Result<Vec<Member>, etcd_client::Error> {
    let mut cluster = connect(endpoints).await?.cluster_client();
    let response = cluster.member_list().await?;
    Ok(response.members().iter().map(convert).collect())
}

/// Register a new member advertising `peer_urls`
pub(crate) async fn member_add(
    endpoints: &[String],
    peer_urls: Vec<String>,
) -> Result<MemberAdded, etcd_client::Error> {
    let mut cluster = connect(endpoints).await?.cluster_client();
    let response = cluster.member_add(peer_urls, None).await?;
    let id = response.member().map_or(0, etcd_client::Member::id);
    debug!("registered member {id:x} with the data plane");
    Ok(MemberAdded {
        id,
        members: response.member_list().iter().map(convert).collect(),
    })
}

/// Remove the member `id` from the data plane
pub(crate) async fn member_remove(endpoints: &[String], id: u64) -> Result<(), etcd_client::Error> {
    let mut cluster = connect(endpoints).await?.cluster_client();
    let _response = cluster.member_remove(id).await?;
    debug!("removed member {id:x} from the data plane");
    Ok(())
}

/// Map a wire member into the in-memory model
fn convert(member: &etcd_client::Member) -> Member {
    Member {
        name: member.name().to_owned(),
        id: member.id(),
        peer_urls: member.peer_urls().to_vec(),
        client_urls: member.client_urls().to_vec(),
    }
}
