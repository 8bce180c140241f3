use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Context, Result};
use colony_domain::{
    now_utc, validate_unit_interval, HotSpot, LocationType, NewTrail, RunId, Scent, Trail,
    TrailId, TrailQuery,
};
use colony_store_core::TrailStore;
use rusqlite::{params_from_iter, types::Value as SqlValue, Row};

use crate::{parse_optional_time, parse_time, rfc3339, SqliteColonyStore};

impl TrailStore for SqliteColonyStore {
    fn lay_trail(&self, trail: &NewTrail) -> Result<Trail> {
        trail.validate()?;

        let created_at = now_utc();
        let expires_at = trail
            .ttl_seconds
            .map(|ttl| {
                created_at
                    .checked_add(time::Duration::seconds(ttl))
                    .ok_or_else(|| anyhow!("ttl_seconds {ttl} overflows the trail expiry"))
            })
            .transpose()?;
        let laid = Trail {
            trail_id: TrailId::new(),
            run_id: trail.run_id,
            location: trail.location.clone(),
            location_type: trail.location_type,
            scent: trail.scent,
            strength: trail.strength,
            agent_id: trail.agent_id.clone(),
            message: trail.message.clone(),
            tags: trail.tags.clone(),
            created_at,
            expires_at,
        };

        self.conn
            .execute(
                "INSERT INTO trails(
                    trail_id, run_id, location, location_type, scent, strength,
                    agent_id, message, tags_json, created_at, expires_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    laid.trail_id.to_string(),
                    laid.run_id.map(|id| id.to_string()),
                    laid.location,
                    laid.location_type.as_str(),
                    laid.scent.as_str(),
                    laid.strength,
                    laid.agent_id,
                    laid.message,
                    serde_json::to_string(&laid.tags)?,
                    rfc3339(laid.created_at)?,
                    laid.expires_at.map(rfc3339).transpose()?,
                ],
            )
            .context("failed to insert trail")?;

        tracing::debug!(
            location = laid.location.as_str(),
            scent = laid.scent.as_str(),
            strength = laid.strength,
            "trail laid"
        );
        Ok(laid)
    }

    fn get_trails(&self, query: &TrailQuery) -> Result<Vec<Trail>> {
        let mut sql = String::from(
            "SELECT trail_id, run_id, location, location_type, scent, strength,
                    agent_id, message, tags_json, created_at, expires_at
             FROM trails WHERE 1 = 1",
        );
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(scent) = query.scent {
            args.push(SqlValue::Text(scent.as_str().to_string()));
            sql.push_str(&format!(" AND scent = ?{}", args.len()));
        }
        if let Some(location) = &query.location {
            args.push(SqlValue::Text(location.clone()));
            sql.push_str(&format!(" AND location = ?{}", args.len()));
        }
        if let Some(run_id) = query.run_id {
            args.push(SqlValue::Text(run_id.to_string()));
            sql.push_str(&format!(" AND run_id = ?{}", args.len()));
        }
        if let Some(min_strength) = query.min_strength {
            validate_unit_interval("min_strength", min_strength)?;
            args.push(SqlValue::Real(min_strength));
            sql.push_str(&format!(" AND strength >= ?{}", args.len()));
        }

        let mut trails = self.load_unexpired(&sql, args)?;
        trails.sort_by(|lhs, rhs| {
            rhs.strength
                .total_cmp(&lhs.strength)
                .then_with(|| rhs.created_at.cmp(&lhs.created_at))
        });
        trails.truncate(query.limit);
        Ok(trails)
    }

    fn get_hot_spots(&self, run_id: Option<RunId>) -> Result<Vec<HotSpot>> {
        let mut sql = String::from(
            "SELECT trail_id, run_id, location, location_type, scent, strength,
                    agent_id, message, tags_json, created_at, expires_at
             FROM trails",
        );
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(run_id) = run_id {
            args.push(SqlValue::Text(run_id.to_string()));
            sql.push_str(" WHERE run_id = ?1");
        }

        let mut grouped: BTreeMap<String, HotSpotAccumulator> = BTreeMap::new();
        for trail in self.load_unexpired(&sql, args)? {
            grouped
                .entry(trail.location.clone())
                .or_insert_with(|| HotSpotAccumulator::new(&trail))
                .add(&trail);
        }

        let mut spots: Vec<HotSpot> = grouped
            .into_iter()
            .map(|(location, acc)| acc.finish(location))
            .collect();
        spots.sort_by(|lhs, rhs| {
            rhs.total_strength
                .total_cmp(&lhs.total_strength)
                .then_with(|| lhs.location.cmp(&rhs.location))
        });
        Ok(spots)
    }

    fn decay_trails(&self, decay_rate: f64) -> Result<usize> {
        validate_unit_interval("decay_rate", decay_rate)?;
        let updated = self
            .conn
            .execute(
                "UPDATE trails SET strength = strength * (1.0 - ?1)",
                rusqlite::params![decay_rate],
            )
            .context("failed to decay trails")?;
        tracing::info!(decay_rate, updated, "trails decayed");
        Ok(updated)
    }
}

impl SqliteColonyStore {
    fn load_unexpired(&self, sql: &str, args: Vec<SqlValue>) -> Result<Vec<Trail>> {
        let now = now_utc();
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params_from_iter(args))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let trail = trail_from_row(row)?;
            if trail.expires_at.is_some_and(|expires_at| expires_at <= now) {
                continue;
            }
            out.push(trail);
        }
        Ok(out)
    }
}

struct HotSpotAccumulator {
    trail_count: u64,
    max_strength: f64,
    total_strength: f64,
    scents: BTreeSet<Scent>,
    agents: BTreeSet<String>,
    last_activity: colony_domain::DateTimeUtc,
}

impl HotSpotAccumulator {
    fn new(first: &Trail) -> Self {
        Self {
            trail_count: 0,
            max_strength: 0.0,
            total_strength: 0.0,
            scents: BTreeSet::new(),
            agents: BTreeSet::new(),
            last_activity: first.created_at,
        }
    }

    fn add(&mut self, trail: &Trail) {
        self.trail_count += 1;
        self.max_strength = self.max_strength.max(trail.strength);
        self.total_strength += trail.strength;
        self.scents.insert(trail.scent);
        self.agents.insert(trail.agent_id.clone());
        self.last_activity = self.last_activity.max(trail.created_at);
    }

    fn finish(self, location: String) -> HotSpot {
        HotSpot {
            location,
            trail_count: self.trail_count,
            max_strength: self.max_strength,
            total_strength: self.total_strength,
            scents: self.scents.into_iter().collect(),
            agents: self.agents.into_iter().collect(),
            last_activity: self.last_activity,
        }
    }
}

fn trail_from_row(row: &Row<'_>) -> Result<Trail> {
    let trail_id: String = row.get(0)?;
    let run_id: Option<String> = row.get(1)?;
    let location_type: String = row.get(3)?;
    let scent: String = row.get(4)?;
    let tags_json: String = row.get(8)?;
    let created_at: String = row.get(9)?;

    Ok(Trail {
        trail_id: TrailId::parse(&trail_id)?,
        run_id: run_id.as_deref().map(RunId::parse).transpose()?,
        location: row.get(2)?,
        location_type: LocationType::parse(&location_type)
            .ok_or_else(|| anyhow!("unknown location type: {location_type}"))?,
        scent: Scent::parse(&scent).ok_or_else(|| anyhow!("unknown scent: {scent}"))?,
        strength: row.get(5)?,
        agent_id: row.get(6)?,
        message: row.get(7)?,
        tags: serde_json::from_str(&tags_json).context("invalid trails.tags_json")?,
        created_at: parse_time(&created_at)?,
        expires_at: parse_optional_time(row.get(10)?)?,
    })
}
