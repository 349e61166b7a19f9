//! Three-way profit split

use rust_decimal::Decimal;

use crate::models::ShareRates;
use crate::money::round_money;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    pub gross: Decimal,
    pub cost: Decimal,
    pub net: Decimal,
    pub platform: Decimal,
    pub operator: Decimal,
    pub shop_owner: Decimal,
}

impl Split {
    pub fn total(&self) -> Decimal {
        self.platform + self.operator + self.shop_owner
    }
}

fn share(net: Decimal, rate: Decimal) -> Decimal {
    round_money(net * rate / Decimal::ONE_HUNDRED)
}

/// Split `gross - cost` by `rates`.
///
/// A non-positive net is absorbed entirely by the platform. Otherwise the
/// platform and operator shares are rounded to money precision and the shop
/// owner takes the remainder, so the three always sum to `net` exactly.
/// Without an operator (owner shipped it) the operator share goes to the owner.
pub fn compute_split(gross: Decimal, cost: Decimal, rates: &ShareRates, has_operator: bool) -> Split {
    let gross = round_money(gross);
    let cost = round_money(cost);
    let net = gross - cost;

    if net <= Decimal::ZERO {
        return Split {
            gross,
            cost,
            net,
            platform: net,
            operator: Decimal::ZERO,
            shop_owner: Decimal::ZERO,
        };
    }

    let platform = share(net, rates.platform);
    let mut operator = share(net, rates.operator);
    let mut shop_owner = net - platform - operator;
    if shop_owner < Decimal::ZERO {
        // both rounded up with a zero owner rate
        operator += shop_owner;
        shop_owner = Decimal::ZERO;
    }
    if !has_operator {
        shop_owner += operator;
        operator = Decimal::ZERO;
    }

    Split {
        gross,
        cost,
        net,
        platform,
        operator,
        shop_owner,
    }
}
