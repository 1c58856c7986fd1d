use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::accountant::{LedgerAccountant, LedgerSummary};
use crate::error::StoreError;
use crate::storage::{
    apply_spend, approve_if_satisfied, electorate, Evaluation, GovernanceStore, MirrorUpdate,
    SpendRecord, VoteApplied, VoteCast,
};
use crate::types::{
    Campaign, CampaignId, CampaignStatus, Contribution, DocumentRef, LedgerRef, RequestId,
    UsageRequest, UsageStatus, UsageVote, UserId,
};
use crate::voting::{Ballot, BallotBox, MutableBallotBox, VoteChoice, VotingPolicy};

const CAMPAIGN_COLUMNS: &str = "id, owner_id, title, goal_minor, raised_minor, deadline, withdrawn, status, ledger_ref, last_synced_at";
const REQUEST_COLUMNS: &str = "id, campaign_id, requester_id, title, description, category, requested_minor, actual_minor, status, supporting_doc, execution_proof, created_at, updated_at";

/// PostgreSQL governance store.
///
/// Mutations open a transaction and take `SELECT ... FOR UPDATE` on the
/// campaign row first, so all writes against one campaign are serialized
/// while different campaigns proceed in parallel.
#[derive(Debug, Clone)]
pub struct PostgresGovernanceStore {
    pool: PgPool,
}

impl PostgresGovernanceStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| backend("postgres connect failed", e))?;

        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS fundgate_campaigns (
                id UUID PRIMARY KEY,
                owner_id TEXT NOT NULL,
                title TEXT NOT NULL,
                goal_minor BIGINT NOT NULL,
                raised_minor BIGINT NOT NULL,
                deadline TIMESTAMPTZ NOT NULL,
                withdrawn BOOLEAN NOT NULL,
                status TEXT NOT NULL,
                ledger_ref TEXT NULL UNIQUE,
                last_synced_at TIMESTAMPTZ NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS fundgate_contributions (
                id BIGSERIAL PRIMARY KEY,
                campaign_id UUID NOT NULL REFERENCES fundgate_campaigns (id),
                donor_id TEXT NOT NULL,
                amount_minor BIGINT NOT NULL,
                contributed_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_fundgate_contributions_donor ON fundgate_contributions (campaign_id, donor_id)",
            r#"
            CREATE TABLE IF NOT EXISTS fundgate_usage_requests (
                id UUID PRIMARY KEY,
                campaign_id UUID NOT NULL REFERENCES fundgate_campaigns (id),
                requester_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                category TEXT NOT NULL,
                requested_minor BIGINT NOT NULL,
                actual_minor BIGINT NULL,
                status TEXT NOT NULL,
                supporting_doc TEXT NULL,
                execution_proof TEXT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_fundgate_usage_requests_campaign ON fundgate_usage_requests (campaign_id)",
            r#"
            CREATE TABLE IF NOT EXISTS fundgate_usage_votes (
                request_id UUID NOT NULL REFERENCES fundgate_usage_requests (id),
                voter_id TEXT NOT NULL,
                choice TEXT NOT NULL,
                weight_minor BIGINT NOT NULL,
                cast_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (request_id, voter_id)
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| backend("postgres schema create failed", e))?;
        }
        Ok(())
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| backend("postgres begin failed", e))
    }

    async fn connection(&self) -> Result<sqlx::pool::PoolConnection<Postgres>, StoreError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| backend("postgres acquire failed", e))
    }
}

#[async_trait]
impl GovernanceStore for PostgresGovernanceStore {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }

    async fn insert_campaign(&self, campaign: Campaign) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO fundgate_campaigns (
                id, owner_id, title, goal_minor, raised_minor, deadline,
                withdrawn, status, ledger_ref, last_synced_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(campaign.id.0)
        .bind(campaign.owner_id.as_str())
        .bind(&campaign.title)
        .bind(to_db(campaign.goal_minor)?)
        .bind(to_db(campaign.raised_minor)?)
        .bind(campaign.deadline)
        .bind(campaign.withdrawn)
        .bind(campaign.status.as_str())
        .bind(campaign.ledger_ref.as_ref().map(LedgerRef::as_str))
        .bind(campaign.last_synced_at)
        .execute(&self.pool)
        .await
        .map_err(|e| backend("postgres campaign insert failed", e))?;
        Ok(())
    }

    async fn campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM fundgate_campaigns WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("postgres campaign load failed", e))?;
        row.as_ref().map(decode_campaign).transpose()
    }

    async fn linked_campaigns(&self) -> Result<Vec<Campaign>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM fundgate_campaigns WHERE ledger_ref IS NOT NULL ORDER BY ledger_ref ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("postgres campaign scan failed", e))?;
        rows.iter().map(decode_campaign).collect()
    }

    async fn apply_mirror(&self, id: CampaignId, update: &MirrorUpdate) -> Result<bool, StoreError> {
        let mut tx = self.begin().await?;
        let campaign = lock_campaign(&mut tx, id).await?;
        let changed = update.differs_from(&campaign);

        sqlx::query(
            r#"
            UPDATE fundgate_campaigns
            SET raised_minor = $2, goal_minor = $3, deadline = $4, withdrawn = $5,
                status = $6, last_synced_at = $7
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(to_db(update.raised_minor)?)
        .bind(to_db(update.goal_minor)?)
        .bind(update.deadline)
        .bind(update.withdrawn)
        .bind(update.status.as_str())
        .bind(update.synced_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend("postgres mirror update failed", e))?;

        commit(tx).await?;
        Ok(changed)
    }

    async fn record_contribution(&self, contribution: Contribution) -> Result<Campaign, StoreError> {
        let mut tx = self.begin().await?;
        let mut campaign = lock_campaign(&mut tx, contribution.campaign_id).await?;
        campaign.raised_minor = campaign.raised_minor.saturating_add(contribution.amount_minor);

        sqlx::query(
            r#"
            INSERT INTO fundgate_contributions (campaign_id, donor_id, amount_minor, contributed_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(contribution.campaign_id.0)
        .bind(contribution.donor_id.as_str())
        .bind(to_db(contribution.amount_minor)?)
        .bind(contribution.contributed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend("postgres contribution insert failed", e))?;

        sqlx::query("UPDATE fundgate_campaigns SET raised_minor = $2 WHERE id = $1")
            .bind(campaign.id.0)
            .bind(to_db(campaign.raised_minor)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("postgres raised update failed", e))?;

        commit(tx).await?;
        Ok(campaign)
    }

    async fn contribution_total(&self, campaign_id: CampaignId, donor: &UserId) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount_minor), 0)::BIGINT AS total
            FROM fundgate_contributions
            WHERE campaign_id = $1 AND donor_id = $2
            "#,
        )
        .bind(campaign_id.0)
        .bind(donor.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| backend("postgres contribution sum failed", e))?;
        from_db(column(&row, "total")?)
    }

    async fn donor_totals(&self, campaign_id: CampaignId) -> Result<BTreeMap<UserId, u64>, StoreError> {
        let mut conn = self.connection().await?;
        load_donor_totals(&mut conn, campaign_id).await
    }

    async fn usage_request(&self, id: RequestId) -> Result<Option<UsageRequest>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM fundgate_usage_requests WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("postgres usage request load failed", e))?;
        row.as_ref().map(decode_request).transpose()
    }

    async fn usage_requests(&self, campaign_id: CampaignId) -> Result<Vec<UsageRequest>, StoreError> {
        let mut conn = self.connection().await?;
        load_requests(&mut conn, campaign_id).await
    }

    async fn ballots(&self, request_id: RequestId) -> Result<MutableBallotBox, StoreError> {
        let mut conn = self.connection().await?;
        load_ballots(&mut conn, request_id).await
    }

    async fn ledger_summary(&self, campaign_id: CampaignId) -> Result<LedgerSummary, StoreError> {
        let campaign = self
            .campaign(campaign_id)
            .await?
            .ok_or(StoreError::CampaignNotFound(campaign_id))?;
        let requests = self.usage_requests(campaign_id).await?;
        Ok(LedgerAccountant::summarize(campaign.raised_minor, &requests))
    }

    async fn insert_within_budget(&self, request: UsageRequest) -> Result<LedgerSummary, StoreError> {
        let mut tx = self.begin().await?;
        let campaign = lock_campaign(&mut tx, request.campaign_id).await?;
        let mut requests = load_requests(&mut tx, campaign.id).await?;
        LedgerAccountant::summarize(campaign.raised_minor, &requests)
            .check_request(request.requested_minor)?;

        sqlx::query(&format!(
            "INSERT INTO fundgate_usage_requests ({REQUEST_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(request.id.0)
        .bind(request.campaign_id.0)
        .bind(request.requester_id.as_str())
        .bind(&request.title)
        .bind(&request.description)
        .bind(&request.category)
        .bind(to_db(request.requested_minor)?)
        .bind(request.actual_minor.map(to_db).transpose()?)
        .bind(request.status.as_str())
        .bind(request.supporting_doc.as_ref().map(|doc| doc.0.as_str()))
        .bind(request.execution_proof.as_ref().map(|doc| doc.0.as_str()))
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend("postgres usage request insert failed", e))?;

        commit(tx).await?;
        requests.push(request);
        Ok(LedgerAccountant::summarize(campaign.raised_minor, &requests))
    }

    async fn cast_vote(
        &self,
        cast: VoteCast,
        policy: &dyn VotingPolicy,
    ) -> Result<VoteApplied, StoreError> {
        let mut tx = self.begin().await?;
        let mut request = lock_request(&mut tx, cast.request_id).await?;
        if request.status != UsageStatus::Pending {
            return Err(StoreError::StatusConflict {
                id: request.id,
                expected: UsageStatus::Pending,
                actual: request.status,
            });
        }

        let totals = load_donor_totals(&mut tx, request.campaign_id).await?;
        let weight = totals.get(&cast.voter_id).copied().unwrap_or(0);

        sqlx::query(
            r#"
            INSERT INTO fundgate_usage_votes (request_id, voter_id, choice, weight_minor, cast_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (request_id, voter_id)
            DO UPDATE SET choice = EXCLUDED.choice,
                          weight_minor = EXCLUDED.weight_minor,
                          cast_at = EXCLUDED.cast_at
            "#,
        )
        .bind(cast.request_id.0)
        .bind(cast.voter_id.as_str())
        .bind(cast.choice.as_str())
        .bind(to_db(weight)?)
        .bind(cast.cast_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend("postgres vote upsert failed", e))?;

        let tally = load_ballots(&mut tx, request.id)
            .await?
            .tally(electorate(&totals));
        let approved_now = approve_if_satisfied(&mut request, &tally, policy, cast.cast_at);
        if approved_now {
            update_request(&mut tx, &request).await?;
        }
        commit(tx).await?;

        Ok(VoteApplied {
            vote: UsageVote {
                request_id: cast.request_id,
                voter_id: cast.voter_id,
                choice: cast.choice,
                weight_minor: weight,
                cast_at: cast.cast_at,
            },
            request,
            tally,
            approved_now,
        })
    }

    async fn evaluate(
        &self,
        request_id: RequestId,
        policy: &dyn VotingPolicy,
        at: DateTime<Utc>,
    ) -> Result<Evaluation, StoreError> {
        let mut tx = self.begin().await?;
        let mut request = lock_request(&mut tx, request_id).await?;
        let totals = load_donor_totals(&mut tx, request.campaign_id).await?;
        let tally = load_ballots(&mut tx, request_id)
            .await?
            .tally(electorate(&totals));
        let approved_now = approve_if_satisfied(&mut request, &tally, policy, at);
        if approved_now {
            update_request(&mut tx, &request).await?;
        }
        commit(tx).await?;

        Ok(Evaluation {
            request,
            tally,
            approved_now,
        })
    }

    async fn cancel(&self, request_id: RequestId, at: DateTime<Utc>) -> Result<UsageRequest, StoreError> {
        let mut tx = self.begin().await?;
        let mut request = lock_request(&mut tx, request_id).await?;
        if request.status != UsageStatus::Pending {
            return Err(StoreError::StatusConflict {
                id: request_id,
                expected: UsageStatus::Pending,
                actual: request.status,
            });
        }
        request.status = UsageStatus::Rejected;
        request.updated_at = at;
        update_request(&mut tx, &request).await?;
        commit(tx).await?;
        Ok(request)
    }

    async fn mark_spent(&self, request_id: RequestId, spend: SpendRecord) -> Result<UsageRequest, StoreError> {
        let mut tx = self.begin().await?;
        let mut request = lock_request(&mut tx, request_id).await?;
        let campaign = lock_campaign(&mut tx, request.campaign_id).await?;
        let requests = load_requests(&mut tx, campaign.id).await?;
        LedgerAccountant::summarize(campaign.raised_minor, &requests)
            .check_spend(&request, spend.actual_minor)?;

        apply_spend(&mut request, spend);
        update_request(&mut tx, &request).await?;
        commit(tx).await?;
        Ok(request)
    }
}

async fn commit(tx: sqlx::Transaction<'static, Postgres>) -> Result<(), StoreError> {
    tx.commit()
        .await
        .map_err(|e| backend("postgres commit failed", e))
}

async fn lock_campaign(conn: &mut PgConnection, id: CampaignId) -> Result<Campaign, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {CAMPAIGN_COLUMNS} FROM fundgate_campaigns WHERE id = $1 FOR UPDATE"
    ))
    .bind(id.0)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| backend("postgres campaign lock failed", e))?
    .ok_or(StoreError::CampaignNotFound(id))?;
    decode_campaign(&row)
}

/// Lock the owning campaign, then read the request under that lock.
async fn lock_request(conn: &mut PgConnection, id: RequestId) -> Result<UsageRequest, StoreError> {
    let row = sqlx::query("SELECT campaign_id FROM fundgate_usage_requests WHERE id = $1")
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| backend("postgres usage request lookup failed", e))?
        .ok_or(StoreError::RequestNotFound(id))?;
    let campaign_id: Uuid = column(&row, "campaign_id")?;
    lock_campaign(&mut *conn, CampaignId(campaign_id)).await?;

    let row = sqlx::query(&format!(
        "SELECT {REQUEST_COLUMNS} FROM fundgate_usage_requests WHERE id = $1 FOR UPDATE"
    ))
    .bind(id.0)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| backend("postgres usage request lock failed", e))?
    .ok_or(StoreError::RequestNotFound(id))?;
    decode_request(&row)
}

async fn load_requests(conn: &mut PgConnection, campaign_id: CampaignId) -> Result<Vec<UsageRequest>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {REQUEST_COLUMNS} FROM fundgate_usage_requests WHERE campaign_id = $1 ORDER BY created_at ASC"
    ))
    .bind(campaign_id.0)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| backend("postgres usage request scan failed", e))?;
    rows.iter().map(decode_request).collect()
}

async fn load_donor_totals(
    conn: &mut PgConnection,
    campaign_id: CampaignId,
) -> Result<BTreeMap<UserId, u64>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT donor_id, SUM(amount_minor)::BIGINT AS total
        FROM fundgate_contributions
        WHERE campaign_id = $1
        GROUP BY donor_id
        "#,
    )
    .bind(campaign_id.0)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| backend("postgres donor totals failed", e))?;

    let mut totals = BTreeMap::new();
    for row in rows {
        let donor: String = column(&row, "donor_id")?;
        totals.insert(UserId(donor), from_db(column(&row, "total")?)?);
    }
    Ok(totals)
}

async fn load_ballots(conn: &mut PgConnection, request_id: RequestId) -> Result<MutableBallotBox, StoreError> {
    let rows = sqlx::query(
        "SELECT voter_id, choice, weight_minor, cast_at FROM fundgate_usage_votes WHERE request_id = $1",
    )
    .bind(request_id.0)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| backend("postgres vote scan failed", e))?;

    let mut ballots = Vec::with_capacity(rows.len());
    for row in rows {
        let choice: String = column(&row, "choice")?;
        ballots.push(Ballot {
            voter: UserId(column(&row, "voter_id")?),
            choice: VoteChoice::parse(&choice)
                .ok_or_else(|| StoreError::Backend(format!("unknown vote choice '{choice}' in postgres")))?,
            weight_minor: from_db(column(&row, "weight_minor")?)?,
            cast_at: column(&row, "cast_at")?,
        });
    }
    Ok(MutableBallotBox::from_ballots(ballots))
}

async fn update_request(conn: &mut PgConnection, request: &UsageRequest) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE fundgate_usage_requests
        SET status = $2, actual_minor = $3, supporting_doc = $4,
            execution_proof = $5, updated_at = $6
        WHERE id = $1
        "#,
    )
    .bind(request.id.0)
    .bind(request.status.as_str())
    .bind(request.actual_minor.map(to_db).transpose()?)
    .bind(request.supporting_doc.as_ref().map(|doc| doc.0.as_str()))
    .bind(request.execution_proof.as_ref().map(|doc| doc.0.as_str()))
    .bind(request.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| backend("postgres usage request update failed", e))?;
    Ok(())
}

fn decode_campaign(row: &PgRow) -> Result<Campaign, StoreError> {
    let status: String = column(row, "status")?;
    let ledger_ref: Option<String> = column(row, "ledger_ref")?;
    Ok(Campaign {
        id: CampaignId(column(row, "id")?),
        owner_id: UserId(column(row, "owner_id")?),
        title: column(row, "title")?,
        goal_minor: from_db(column(row, "goal_minor")?)?,
        raised_minor: from_db(column(row, "raised_minor")?)?,
        deadline: column(row, "deadline")?,
        withdrawn: column(row, "withdrawn")?,
        status: CampaignStatus::parse(&status)
            .ok_or_else(|| StoreError::Backend(format!("unknown campaign status '{status}' in postgres")))?,
        ledger_ref: ledger_ref.map(LedgerRef),
        last_synced_at: column(row, "last_synced_at")?,
    })
}

fn decode_request(row: &PgRow) -> Result<UsageRequest, StoreError> {
    let status: String = column(row, "status")?;
    let actual: Option<i64> = column(row, "actual_minor")?;
    let supporting_doc: Option<String> = column(row, "supporting_doc")?;
    let execution_proof: Option<String> = column(row, "execution_proof")?;
    Ok(UsageRequest {
        id: RequestId(column(row, "id")?),
        campaign_id: CampaignId(column(row, "campaign_id")?),
        requester_id: UserId(column(row, "requester_id")?),
        title: column(row, "title")?,
        description: column(row, "description")?,
        category: column(row, "category")?,
        requested_minor: from_db(column(row, "requested_minor")?)?,
        actual_minor: actual.map(from_db).transpose()?,
        status: UsageStatus::parse(&status)
            .ok_or_else(|| StoreError::Backend(format!("unknown usage status '{status}' in postgres")))?,
        supporting_doc: supporting_doc.map(DocumentRef),
        execution_proof: execution_proof.map(DocumentRef),
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Backend(format!("postgres decode {name} failed: {e}")))
}

fn backend(context: &str, err: sqlx::Error) -> StoreError {
    StoreError::Backend(format!("{context}: {err}"))
}

fn to_db(amount: u64) -> Result<i64, StoreError> {
    i64::try_from(amount)
        .map_err(|_| StoreError::Backend(format!("amount {amount} exceeds postgres BIGINT range")))
}

fn from_db(amount: i64) -> Result<u64, StoreError> {
    u64::try_from(amount)
        .map_err(|_| StoreError::Backend(format!("negative amount {amount} in storage")))
}
