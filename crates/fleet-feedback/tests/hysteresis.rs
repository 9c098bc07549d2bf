//! A value inside the current level's band never moves the level, for any
//! band table: dense or sparse, overlapping or disjoint, bounded or not.

use fleet_core::{BandTable, Level, LevelBand};
use fleet_feedback::FeedbackController;
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
struct GenBand {
    lower: i64,
    width: i64,
    unbounded: bool,
}

impl GenBand {
    fn band(self) -> LevelBand {
        let upper = if self.unbounded {
            i64::MAX
        } else {
            self.lower + self.width
        };
        LevelBand::new(upper, self.lower)
    }
}

fn gen_band() -> impl Strategy<Value = GenBand> {
    (-10_000i64..10_000, 0i64..2_000, prop::bool::weighted(0.1)).prop_map(
        |(lower, width, unbounded)| GenBand {
            lower,
            width,
            unbounded,
        },
    )
}

/// Up to ten optional bands, at least one present.
fn gen_table() -> impl Strategy<Value = BandTable> {
    prop::collection::vec(prop::option::of(gen_band()), Level::ALL.len())
        .prop_filter("at least one band", |rows| rows.iter().any(Option::is_some))
        .prop_map(|rows| {
            rows.into_iter()
                .enumerate()
                .filter_map(|(index, row)| {
                    let level = Level::from_index(index)?;
                    row.map(|b| (level, b.band()))
                })
                .collect()
        })
}

/// A configured level of `table` and values inside its band.
fn table_level_values() -> impl Strategy<Value = (BandTable, Level, Vec<i64>)> {
    gen_table().prop_flat_map(|table| {
        let levels: Vec<Level> = table.iter().map(|(level, _)| level).collect();
        (Just(table), prop::sample::select(levels)).prop_flat_map(|(table, level)| {
            let band = *table.get(level).expect("level selected from table");
            let span = band.upper.saturating_sub(band.lower).min(1_000_000);
            let values = prop::collection::vec(0..=span, 1..20)
                .prop_map(move |offsets| offsets.into_iter().map(|o| band.lower + o).collect());
            (Just(table), Just(level), values)
        })
    })
}

proptest! {
    #[test]
    fn resolve_holds_inside_current_band((table, level, values) in table_level_values()) {
        for value in values {
            prop_assert_eq!(table.resolve(level, value), level);
        }
    }

    #[test]
    fn band_edges_hold((table, level, _) in table_level_values()) {
        let band = *table.get(level).unwrap();
        prop_assert_eq!(table.resolve(level, band.lower), level);
        prop_assert_eq!(table.resolve(level, band.upper), level);
    }

    #[test]
    fn controller_holds_inside_current_band((table, level, values) in table_level_values()) {
        let mut controller = FeedbackController::new("cpu", level, table);
        for value in values {
            prop_assert_eq!(controller.set_input(value), level);
            prop_assert_eq!(controller.output(), level);
        }
    }
}
