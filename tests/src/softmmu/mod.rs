mod tlb;
