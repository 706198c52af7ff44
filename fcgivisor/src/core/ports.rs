//! Deterministic port allocation.

/// Smallest port `>= base` that is not in `occupied`.
///
/// Returns `None` when every port from `base` up to `u16::MAX` is taken.
pub fn next_free_port<I>(occupied: I, base: u16) -> Option<u16>
where
    I: IntoIterator<Item = u16>,
{
    let mut ports: Vec<u16> = occupied.into_iter().filter(|port| *port >= base).collect();
    ports.sort_unstable();
    ports.dedup();

    let mut candidate = base;
    for port in ports {
        if port != candidate {
            break;
        }
        candidate = candidate.checked_add(1)?;
    }
    Some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_returns_base() {
        assert_eq!(next_free_port([], 9500), Some(9500));
    }

    #[test]
    fn fills_first_gap() {
        assert_eq!(next_free_port([9500, 9501, 9503], 9500), Some(9502));
    }

    #[test]
    fn ignores_order_and_duplicates() {
        assert_eq!(next_free_port([9501, 9500, 9501, 9502], 9500), Some(9503));
    }

    #[test]
    fn ports_below_base_do_not_count() {
        assert_eq!(next_free_port([80, 443, 9499], 9500), Some(9500));
    }

    #[test]
    fn exhausted_range_returns_none() {
        assert_eq!(next_free_port([65534, 65535], 65534), None);
    }
}
