// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Solver Collaborator
//!
//! The routing problem a job carries, the [`Solver`] interface workers call,
//! and a nearest-neighbour baseline. Solvers are synchronous and may be slow;
//! the worker runs them on the blocking thread pool.

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SolverError {
    #[error("solver failed `{0}`")]
    Failed(String),
}

fn default_vehicles() -> usize {
    1
}

/// A vehicle routing problem over planar locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteProblem {
    pub locations: Vec<[f64; 2]>,
    #[serde(default)]
    pub time_windows: Option<Vec<[i64; 2]>>,
    #[serde(default)]
    pub depot: usize,
    #[serde(default = "default_vehicles")]
    pub num_vehicles: usize,
}

impl RouteProblem {
    /// Parses and validates the `problem` object of a job.
    pub fn from_value(value: &Value) -> Result<RouteProblem, AmqpError> {
        let problem: RouteProblem = serde_json::from_value(value.clone())
            .map_err(|err| AmqpError::DecodeError(err.to_string()))?;
        problem.validate()?;
        Ok(problem)
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.locations.is_empty() {
            return Err(AmqpError::DecodeError("locations must not be empty".to_owned()));
        }

        if self.depot >= self.locations.len() {
            return Err(AmqpError::DecodeError(format!(
                "depot {} is out of range",
                self.depot
            )));
        }

        if self.num_vehicles == 0 {
            return Err(AmqpError::DecodeError(
                "num_vehicles must be greater than 0".to_owned(),
            ));
        }

        if let Some(windows) = &self.time_windows {
            if windows.len() != self.locations.len() {
                return Err(AmqpError::DecodeError(
                    "time_windows must have one entry per location".to_owned(),
                ));
            }
        }

        Ok(())
    }

    /// Euclidean distances between every pair of locations.
    pub fn distance_matrix(&self) -> Vec<Vec<f64>> {
        self.locations
            .iter()
            .map(|from| {
                self.locations
                    .iter()
                    .map(|to| (from[0] - to[0]).hypot(from[1] - to[1]))
                    .collect()
            })
            .collect()
    }
}

/// Computes a route plan for a problem. `Ok(None)` means no feasible
/// solution exists.
#[cfg_attr(test, automock)]
pub trait Solver: Send + Sync {
    fn solve(&self, problem: &RouteProblem) -> Result<Option<Value>, SolverError>;
}

impl<F> Solver for F
where
    F: Fn(&RouteProblem) -> Result<Option<Value>, SolverError> + Send + Sync,
{
    fn solve(&self, problem: &RouteProblem) -> Result<Option<Value>, SolverError> {
        self(problem)
    }
}

/// Greedy baseline: one nearest-neighbour tour from the depot, cut into
/// contiguous legs, one per vehicle. Time windows are not supported and
/// yield no solution.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestNeighbourSolver;

impl Solver for NearestNeighbourSolver {
    fn solve(&self, problem: &RouteProblem) -> Result<Option<Value>, SolverError> {
        if problem.time_windows.is_some() {
            return Ok(None);
        }

        let matrix = problem.distance_matrix();
        let tour = nearest_neighbour_tour(&matrix, problem.depot);
        let leg_len = tour.len().div_ceil(problem.num_vehicles).max(1);

        let mut objective = 0.0;
        let mut max_route_distance: f64 = 0.0;
        let mut route_plans = Vec::with_capacity(problem.num_vehicles);

        for vehicle_id in 0..problem.num_vehicles {
            let leg = tour
                .chunks(leg_len)
                .nth(vehicle_id)
                .unwrap_or_default();

            let mut nodes = Vec::with_capacity(leg.len() + 2);
            nodes.push(problem.depot);
            nodes.extend_from_slice(leg);
            nodes.push(problem.depot);

            let route_distance: f64 = nodes.windows(2).map(|arc| matrix[arc[0]][arc[1]]).sum();
            objective += route_distance;
            max_route_distance = max_route_distance.max(route_distance);

            route_plans.push(json!({
                "vehicle_id": vehicle_id,
                "routes": nodes
                    .iter()
                    .map(|node| json!({ "route_index": node }))
                    .collect::<Vec<_>>(),
                "route_distance": route_distance,
            }));
        }

        Ok(Some(json!({
            "objective": objective,
            "max_route_distance": max_route_distance,
            "route_plans": route_plans,
        })))
    }
}

/// Visits every non-depot node, always moving to the closest unvisited one.
fn nearest_neighbour_tour(matrix: &[Vec<f64>], depot: usize) -> Vec<usize> {
    let mut visited = vec![false; matrix.len()];
    visited[depot] = true;

    let mut tour = Vec::with_capacity(matrix.len().saturating_sub(1));
    let mut current = depot;

    while let Some(next) = (0..matrix.len())
        .filter(|node| !visited[*node])
        .min_by(|a, b| matrix[current][*a].total_cmp(&matrix[current][*b]))
    {
        visited[next] = true;
        tour.push(next);
        current = next;
    }

    tour
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(value: Value) -> RouteProblem {
        RouteProblem::from_value(&value).unwrap()
    }

    fn route_of(solution: &Value, vehicle: usize) -> Vec<u64> {
        solution["route_plans"][vehicle]["routes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["route_index"].as_u64().unwrap())
            .collect()
    }

    #[test]
    fn applies_defaults() {
        let p = problem(json!({"locations": [[0, 0], [0, 1], [1, 1]]}));
        assert_eq!(p.depot, 0);
        assert_eq!(p.num_vehicles, 1);
        assert_eq!(p.time_windows, None);
    }

    #[test]
    fn rejects_invalid_problems() {
        for value in [
            json!({}),
            json!({"locations": []}),
            json!({"locations": [[0, 0]], "depot": 1}),
            json!({"locations": [[0, 0]], "num_vehicles": 0}),
            json!({"locations": [[0, 0], [1, 1]], "time_windows": [[0, 5]]}),
            json!({"locations": "nowhere"}),
        ] {
            assert!(matches!(
                RouteProblem::from_value(&value),
                Err(AmqpError::DecodeError(_))
            ));
        }
    }

    #[test]
    fn visits_nearest_location_first() {
        let p = problem(json!({"locations": [[0, 0], [5, 5], [0, 1], [1, 1]]}));
        let solution = NearestNeighbourSolver.solve(&p).unwrap().unwrap();

        assert_eq!(route_of(&solution, 0), vec![0, 2, 3, 1, 0]);
        let distance = solution["route_plans"][0]["route_distance"].as_f64().unwrap();
        let expected = 1.0 + 1.0 + 32f64.sqrt() + 50f64.sqrt();
        assert!((distance - expected).abs() < 1e-9);
        assert_eq!(solution["objective"].as_f64(), Some(distance));
    }

    #[test]
    fn splits_tour_across_vehicles() {
        let p = problem(json!({
            "locations": [[0, 0], [1, 0], [2, 0], [3, 0], [4, 0]],
            "num_vehicles": 2
        }));
        let solution = NearestNeighbourSolver.solve(&p).unwrap().unwrap();

        assert_eq!(route_of(&solution, 0), vec![0, 1, 2, 0]);
        assert_eq!(route_of(&solution, 1), vec![0, 3, 4, 0]);
        assert_eq!(solution["max_route_distance"].as_f64(), Some(8.0));
    }

    #[test]
    fn idle_vehicles_stay_at_depot() {
        let p = problem(json!({"locations": [[0, 0], [1, 0]], "num_vehicles": 3}));
        let solution = NearestNeighbourSolver.solve(&p).unwrap().unwrap();

        assert_eq!(route_of(&solution, 0), vec![0, 1, 0]);
        assert_eq!(route_of(&solution, 2), vec![0, 0]);
    }

    #[test]
    fn time_windows_are_infeasible_for_the_baseline() {
        let p = problem(json!({
            "locations": [[0, 0], [1, 0]],
            "time_windows": [[0, 10], [2, 4]]
        }));
        assert_eq!(NearestNeighbourSolver.solve(&p), Ok(None));
    }

    #[test]
    fn closures_are_solvers() {
        let solver = |_: &RouteProblem| -> Result<Option<Value>, SolverError> {
            Ok(Some(json!({"route": [0, 1, 2, 0]})))
        };
        let p = problem(json!({"locations": [[0, 0]]}));
        assert_eq!(
            Solver::solve(&solver, &p),
            Ok(Some(json!({"route": [0, 1, 2, 0]})))
        );
    }
}
