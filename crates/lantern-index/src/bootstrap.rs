//! Relevance bootstrap and full-repo rescans.
//!
//! On startup the principal's follow list is scraped from their origin host
//! (once; `sync_infos.follows_synced` remembers completion) and the
//! relevance set is seeded with the principal plus everyone they follow.

use tracing::{info, warn};

use lantern_atproto::car::parse_repo_car;
use lantern_atproto::identity::IdentityDirectory;
use lantern_atproto::records::{GraphFollow, FOLLOW_COLLECTION};
use lantern_atproto::{ipld_to_json, AtUri, OpAction, RecordOp, XrpcClient};

use crate::{IndexError, Indexer};

/// Scrape the principal's follows from their origin host if we have not done
/// so yet. Inserts run in conflict-ignoring batches.
pub async fn ensure_follows_scraped(
    indexer: &Indexer,
    client: &XrpcClient,
    principal_did: &str,
) -> Result<(), IndexError> {
    let repo = indexer.repos().get_or_create(principal_did).await?;

    let synced: Option<bool> =
        sqlx::query_scalar("SELECT follows_synced FROM sync_infos WHERE repo = $1")
            .bind(repo.id)
            .fetch_optional(&indexer.db().crud)
            .await?;

    match synced {
        Some(true) => return Ok(()),
        Some(false) => {}
        None => {
            sqlx::query("INSERT INTO sync_infos (repo) VALUES ($1) ON CONFLICT (repo) DO NOTHING")
                .bind(repo.id)
                .execute(&indexer.db().crud)
                .await?;
        }
    }

    let mut rkeys: Vec<String> = Vec::new();
    let mut subjects: Vec<i64> = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let resp = client
            .list_records(principal_did, FOLLOW_COLLECTION, 100, cursor.as_deref())
            .await?;

        for item in &resp.records {
            let follow: GraphFollow = match serde_json::from_value(item.value.clone()) {
                Ok(f) => f,
                Err(e) => {
                    warn!(uri = %item.uri, error = %e, "skipping malformed follow record");
                    continue;
                }
            };

            let subject = indexer.repos().get_or_create(&follow.subject).await?;
            let puri = AtUri::parse(&item.uri)?;
            rkeys.push(puri.rkey);
            subjects.push(subject.id);
        }

        if resp.cursor.is_none() || resp.records.is_empty() {
            break;
        }
        cursor = resp.cursor;
    }

    sqlx::query(
        "INSERT INTO follows (created, indexed, author, rkey, subject)
         SELECT now(), now(), $1, t.rkey, t.subject
         FROM UNNEST($2::text[], $3::bigint[]) AS t(rkey, subject)
         ON CONFLICT DO NOTHING",
    )
    .bind(repo.id)
    .bind(&rkeys)
    .bind(&subjects)
    .execute(&indexer.db().crud)
    .await?;

    sqlx::query("UPDATE sync_infos SET follows_synced = true WHERE repo = $1")
        .bind(repo.id)
        .execute(&indexer.db().crud)
        .await?;

    info!(count = rkeys.len(), "scraped principal follows");
    Ok(())
}

/// Seed the relevance set: the principal plus every DID they follow.
pub async fn load_relevant_dids(
    indexer: &Indexer,
    client: &XrpcClient,
    principal_did: &str,
) -> Result<(), IndexError> {
    ensure_follows_scraped(indexer, client, principal_did).await?;

    let repo = indexer.repos().get_or_create(principal_did).await?;

    let dids: Vec<String> = sqlx::query_scalar(
        "SELECT r.did FROM follows f
         LEFT JOIN repos r ON f.subject = r.id
         WHERE f.author = $1",
    )
    .bind(repo.id)
    .fetch_all(&indexer.db().crud)
    .await?;

    indexer.relevance().add(principal_did);
    for did in &dids {
        indexer.relevance().add(did);
    }

    info!(count = indexer.relevance().len(), "loaded relevant DID set");
    Ok(())
}

/// Pull a repo's full CAR from its origin host and replay every record
/// through the create path. The DID becomes relevant first so nothing gets
/// gated away.
pub async fn rescan_repo(
    indexer: &Indexer,
    dir: &dyn IdentityDirectory,
    did: &str,
) -> Result<(), IndexError> {
    let ident = dir.lookup_did(did).await?;
    indexer.relevance().add(did);

    let client = XrpcClient::new(&ident.pds)?;
    let (car_bytes, _rev) = client.get_repo(did).await?;
    let repo_car = parse_repo_car(&car_bytes).await?;

    info!(did = %did, records = repo_car.records.len(), "rescanning repo");

    for record in &repo_car.records {
        let Some((collection, rkey)) = record.path.split_once('/') else {
            warn!(path = %record.path, "skipping malformed repo path");
            continue;
        };

        let ipld: ipld_core::ipld::Ipld = match serde_ipld_dagcbor::from_slice(&record.data) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %record.path, error = %e, "skipping undecodable record");
                continue;
            }
        };

        let op = RecordOp {
            action: OpAction::Create,
            collection: collection.to_string(),
            rkey: rkey.to_string(),
            cid: Some(record.cid.clone()),
            record: Some(ipld_to_json(ipld)),
        };

        if let Err(e) = indexer.handle_op(did, "", &op).await {
            warn!(path = %record.path, error = %e, "failed to index record during rescan");
        }
    }

    Ok(())
}
