mod common;

use bromosim::core::{
    ChunkSize, DuplicatePolicy, OverflowPolicy, Population, RandomStream, StreamSource,
    TimestampOptions, TrajectoryOptions,
};
use bromosim::error::{Error, Result};
use bromosim::store::{ArrayStore, MemoryStore};
use bromosim::Simulation;

use common::{constant_emission, init_logging, make_sim};

fn diffused(n: usize, t_max: f64) -> Result<(Simulation, MemoryStore)> {
    let sim = make_sim(n, t_max)?;
    let mut store = MemoryStore::new();
    let opts = TrajectoryOptions {
        chunk_size: ChunkSize::Steps(400),
        ..Default::default()
    };
    sim.simulate_diffusion(&mut store, opts, StreamSource::Seed(3))?;
    Ok((sim, store))
}

fn read_stream(store: &MemoryStore, name: &str) -> Result<(Vec<i64>, Vec<u8>)> {
    Ok((store.read_i64(name)?, store.read_u8(&format!("{name}_par"))?))
}

/// Equal ticks keep particle order, so (tick, tag) pairs never decrease.
fn assert_time_ordered(ticks: &[i64], tags: &[u8]) {
    assert_eq!(ticks.len(), tags.len());
    for i in 1..ticks.len() {
        assert!(
            (ticks[i - 1], tags[i - 1]) <= (ticks[i], tags[i]),
            "out of order at {i}: {:?} then {:?}",
            (ticks[i - 1], tags[i - 1]),
            (ticks[i], tags[i])
        );
    }
}

#[test]
fn single_population_stream() -> Result<()> {
    init_logging();
    let (sim, mut store) = diffused(6, 4e-3)?;
    let cp = sim
        .simulate_timestamps(&mut store, 5e7, Some(1e5), TimestampOptions::default(), StreamSource::Seed(1))?
        .ok_or_else(|| Error::InvalidState("unexpected skip".into()))?;

    assert!(cp.name.starts_with("timestamps/max_rate50000kcps_bg100000cps_rs_"));
    assert_eq!(cp.name.rsplit('_').next().map(str::len), Some(4));
    assert_eq!(cp.cursor, sim.n_samples());

    let (ticks, tags) = read_stream(&store, &cp.name)?;
    assert!(!ticks.is_empty());
    assert_time_ordered(&ticks, &tags);
    let end = sim.n_samples() as i64 * 10;
    assert!(ticks.iter().all(|&t| t % 10 == 0 && (0..end).contains(&t)));
    assert!(tags.iter().all(|&p| usize::from(p) <= 6));
    // lambda = 0.05 per step over 8000 steps
    assert!(tags.iter().any(|&p| p == 6), "no background photon tagged 6");

    let params = store
        .attr(&format!("{}/params", cp.name))
        .ok_or_else(|| Error::MissingArtifact("params".into()))?;
    assert_eq!(params["bg_particle"], 6);
    assert!(store.attr("timestamps/init_random_state").is_some());
    assert!(store.attr("timestamps/last_random_state").is_some());
    Ok(())
}

#[test]
fn populations_merge_in_time_order() -> Result<()> {
    let sim = make_sim(6, 2e-3)?;
    // lambda = 0.01 * rate * 0.5e-6 per step: 0.25 and 0.1
    let mut store = constant_emission(&sim, 0.01)?;
    let pops = Population::mixture(&[0..2, 2..6], &[5e7, 2e7], Some(2e5))?;
    let cp = sim
        .simulate_timestamps_mix(&mut store, pops, TimestampOptions::default(), StreamSource::Seed(8))?
        .ok_or_else(|| Error::InvalidState("unexpected skip".into()))?;
    assert!(cp
        .name
        .starts_with("timestamps/Pop1_P0_1_max_rate50000kcps_Pop2_P2_5_max_rate20000kcps_bg200000cps_rs_"));

    let (ticks, tags) = read_stream(&store, &cp.name)?;
    assert_time_ordered(&ticks, &tags);
    // tags are global particle indices, background last
    for tag in 0..=6u8 {
        assert!(tags.contains(&tag), "no photon tagged {tag}");
    }
    let first_pop = tags.iter().filter(|&&p| p < 2).count() as f64 / 2.0;
    let second_pop = tags.iter().filter(|&&p| (2..6).contains(&p)).count() as f64 / 4.0;
    assert!(first_pop > 2.0 * second_pop, "{first_pop} vs {second_pop} per particle");
    Ok(())
}

#[test]
fn zero_emission_gives_empty_stream() -> Result<()> {
    let sim = make_sim(3, 1e-3)?;
    let mut store = constant_emission(&sim, 0.0)?;

    let cp = sim
        .simulate_timestamps(&mut store, 1e6, None, TimestampOptions::default(), StreamSource::Seed(1))?
        .ok_or_else(|| Error::InvalidState("unexpected skip".into()))?;
    let (ticks, tags) = read_stream(&store, &cp.name)?;
    assert!(ticks.is_empty() && tags.is_empty());
    // no draws for zero rates
    assert_eq!(cp.stream, RandomStream::new(1, 0, 0).checkpoint());
    Ok(())
}

#[test]
fn duplicate_policies() -> Result<()> {
    let (sim, mut store) = diffused(3, 1e-3)?;
    let start = RandomStream::new(4, 0, 0).checkpoint();
    let run = |store: &mut MemoryStore, policy| {
        let opts = TimestampOptions {
            on_duplicate: policy,
            ..Default::default()
        };
        sim.simulate_timestamps(store, 5e7, None, opts, StreamSource::Resume(start.clone()))
    };

    let first = run(&mut store, DuplicatePolicy::Fail)?
        .ok_or_else(|| Error::InvalidState("unexpected skip".into()))?;
    let (ticks, _) = read_stream(&store, &first.name)?;

    assert!(matches!(run(&mut store, DuplicatePolicy::Fail), Err(Error::AlreadyExists(_))));
    assert_eq!(run(&mut store, DuplicatePolicy::Skip)?, None);
    assert_eq!(store.read_i64(&first.name)?, ticks);

    let again = run(&mut store, DuplicatePolicy::Overwrite)?
        .ok_or_else(|| Error::InvalidState("unexpected skip".into()))?;
    assert_eq!(again.name, first.name);
    // same start state, same stream
    assert_eq!(store.read_i64(&first.name)?, ticks);
    Ok(())
}

#[test]
fn saved_state_continues_across_runs() -> Result<()> {
    let (sim, mut store) = diffused(3, 1e-3)?;
    let opts = TimestampOptions::default();
    let first = sim
        .simulate_timestamps(&mut store, 5e7, Some(1e5), opts, StreamSource::Seed(1))?
        .ok_or_else(|| Error::InvalidState("unexpected skip".into()))?;

    // the explicit stream is dropped in favour of the saved last state
    let explicit = StreamSource::Stream(RandomStream::from_seed(1));
    let second = sim
        .simulate_timestamps(&mut store, 5e7, Some(1e5), opts, explicit)?
        .ok_or_else(|| Error::InvalidState("unexpected skip".into()))?;
    assert_ne!(first.name, second.name);
    let init: bromosim::core::StreamCheckpoint = serde_json::from_value(
        store
            .attr("timestamps/init_random_state")
            .ok_or_else(|| Error::MissingArtifact("init_random_state".into()))?,
    )?;
    assert_eq!(init, first.stream);
    Ok(())
}

#[test]
fn overflow_policy_applies_to_runs() -> Result<()> {
    let sim = make_sim(1, 1e-4)?;
    let mut store = constant_emission(&sim, 1.0)?;

    // lambda = 1e10 * 0.5e-6 = 5000 per step
    let err = sim
        .simulate_timestamps(&mut store, 1e10, None, TimestampOptions::default(), StreamSource::Seed(1))
        .unwrap_err();
    assert!(matches!(err, Error::CountOverflow { .. }));

    let opts = TimestampOptions {
        overflow: OverflowPolicy::Saturate,
        on_duplicate: DuplicatePolicy::Overwrite,
        ..Default::default()
    };
    let cp = sim
        .simulate_timestamps(&mut store, 1e10, None, opts, StreamSource::Seed(1))?
        .ok_or_else(|| Error::InvalidState("unexpected skip".into()))?;
    assert_eq!(store.len(&cp.name)?, 255 * sim.n_samples());
    Ok(())
}

/// A stream left behind by an aborted run is neither skipped nor reported as a duplicate.
#[test]
fn aborted_stream_is_not_complete() -> Result<()> {
    let sim = make_sim(1, 1e-4)?;
    let mut store = constant_emission(&sim, 1.0)?;
    let with = |policy, overflow| TimestampOptions {
        on_duplicate: policy,
        overflow,
        ..Default::default()
    };

    let err = sim
        .simulate_timestamps(&mut store, 1e10, None, with(DuplicatePolicy::Fail, OverflowPolicy::Error), StreamSource::Seed(1))
        .unwrap_err();
    assert!(matches!(err, Error::CountOverflow { .. }));
    assert!(store.attr("timestamps/last_random_state").is_none());

    for policy in [DuplicatePolicy::Skip, DuplicatePolicy::Fail] {
        let retry = sim.simulate_timestamps(&mut store, 1e10, None, with(policy, OverflowPolicy::Saturate), StreamSource::Seed(1));
        assert!(matches!(retry, Err(Error::InvalidState(_))), "{policy:?}: {retry:?}");
    }

    let cp = sim
        .simulate_timestamps(
            &mut store,
            1e10,
            None,
            with(DuplicatePolicy::Overwrite, OverflowPolicy::Saturate),
            StreamSource::Resume(RandomStream::new(1, 0, 0).checkpoint()),
        )?
        .ok_or_else(|| Error::InvalidState("unexpected skip".into()))?;
    assert_eq!(store.attr(&format!("{}/complete", cp.name)), Some(serde_json::json!(true)));

    let again = sim.simulate_timestamps(
        &mut store,
        1e10,
        None,
        with(DuplicatePolicy::Skip, OverflowPolicy::Saturate),
        StreamSource::Resume(RandomStream::new(1, 0, 0).checkpoint()),
    )?;
    assert_eq!(again, None);
    Ok(())
}
